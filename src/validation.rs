//! Input checks for job submissions. Nothing reaches the store unless it
//! passes through [`validate_submission`].

use std::{fmt, sync::LazyLock};

use regex::Regex;

use crate::job::{MediaFormat, Quality};

// watch, short-link and shorts URLs, with optional scheme and `www.`
static VIDEO_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:https?://)?(?:www\.)?(?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/shorts/)[A-Za-z0-9_-]+",
    )
    .unwrap()
});

/// A submission that passed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub url: String,
    pub format: MediaFormat,
    pub quality: Quality,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationError {
    Url,
    Format(String),
    Quality(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url => f.write_str("invalid url: expected a youtube watch, youtu.be or shorts link"),
            Self::Format(value) => {
                write!(f, "invalid format '{value}': expected one of mp4, mp3, webm")
            }
            Self::Quality(value) => write!(
                f,
                "invalid quality '{value}': expected one of 1080p, 720p, 480p, 360p, best"
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

pub fn is_supported_url(url: &str) -> bool {
    VIDEO_URL.is_match(url.trim())
}

pub fn validate_submission(
    url: &str,
    format: &str,
    quality: &str,
) -> Result<Submission, ValidationError> {
    let url = url.trim();
    if !is_supported_url(url) {
        return Err(ValidationError::Url);
    }
    let format = format
        .parse::<MediaFormat>()
        .map_err(|_| ValidationError::Format(format.to_string()))?;
    let quality = quality
        .parse::<Quality>()
        .map_err(|_| ValidationError::Quality(quality.to_string()))?;

    Ok(Submission {
        url: url.to_string(),
        format,
        quality,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_the_three_url_shapes() {
        for url in [
            "https://www.youtube.com/watch?v=abc123",
            "http://youtube.com/watch?v=dQw4w9WgXcQ&t=42",
            "youtube.com/watch?v=a_b-c",
            "https://youtu.be/dQw4w9WgXcQ",
            "www.youtu.be/xyz",
            "https://www.youtube.com/shorts/Abc_12-3",
        ] {
            assert!(is_supported_url(url), "{url} should be accepted");
        }
    }

    #[test]
    fn rejects_other_hosts_and_shapes() {
        for url in [
            "",
            "https://vimeo.com/123",
            "https://www.youtube.com/channel/UC123",
            "https://www.youtube.com/watch?list=abc",
            "https://youtu.be/",
            "ftp://youtube.com/watch?v=abc",
            "https://evil.example/?u=https://youtu.be/abc",
        ] {
            assert!(!is_supported_url(url), "{url} should be rejected");
        }
    }

    #[test]
    fn validate_submission_parses_all_fields() {
        let submission =
            validate_submission(" https://youtu.be/abc123 ", "webm", "480p").unwrap();
        assert_eq!(submission.url, "https://youtu.be/abc123");
        assert_eq!(submission.format, MediaFormat::Webm);
        assert_eq!(submission.quality, Quality::P480);
    }

    #[test]
    fn validate_submission_names_the_bad_field() {
        assert_eq!(
            validate_submission("https://example.com", "mp4", "best").unwrap_err(),
            ValidationError::Url
        );
        assert_eq!(
            validate_submission("https://youtu.be/abc", "avi", "best").unwrap_err(),
            ValidationError::Format("avi".into())
        );
        let err = validate_submission("https://youtu.be/abc", "mp4", "4k").unwrap_err();
        assert!(err.to_string().contains("4k"));
    }
}
