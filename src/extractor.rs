//! Seam between the job pipeline and the library that actually knows how to
//! talk to the hosting site.
//!
//! The pipeline only needs two things from it: the list of encodings a URL
//! offers, and a way to stream one of them to disk while hearing about bytes
//! transferred. [`YtDlp`] is the production implementation; tests plug in
//! their own.

mod ytdlp;

use std::{cmp::Ordering, path::Path};

use anyhow::Result;
use async_trait::async_trait;

use crate::job::{MediaFormat, Quality};

pub use ytdlp::YtDlp;

/// One retrievable variant of the source (container + quality).
#[derive(Clone, Debug, PartialEq)]
pub struct Encoding {
    pub format_id: String,
    pub container: String,
    pub quality: Option<String>,
    pub height: Option<u32>,
    pub has_video: bool,
    pub has_audio: bool,
    pub approx_size: Option<u64>,
    /// Average bitrate in kbit/s when known.
    pub bitrate: Option<f64>,
}

impl Encoding {
    fn matches_quality(&self, quality: Quality) -> bool {
        let Some(height) = quality.height() else {
            return true;
        };
        self.height == Some(height)
            || self
                .quality
                .as_deref()
                .is_some_and(|label| label.starts_with(quality.as_str()))
    }
}

#[derive(Clone, Debug)]
pub struct MediaInfo {
    pub title: String,
    pub encodings: Vec<Encoding>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Lists the encodings available for `url`.
    async fn probe(&self, url: &str) -> Result<MediaInfo>;

    /// Writes `encoding` to `dest`, calling `on_progress` as bytes arrive.
    async fn fetch(
        &self,
        url: &str,
        encoding: &Encoding,
        dest: &Path,
        on_progress: &(dyn Fn(TransferProgress) + Send + Sync),
    ) -> Result<()>;
}

/// Picks the encoding that satisfies a request, if any.
///
/// Audio requests take the richest audio-only stream. Video requests stay
/// within the requested container and prefer streams that already carry
/// audio; `best` then takes the tallest frame, fixed qualities must match
/// exactly.
pub fn select_encoding(
    encodings: &[Encoding],
    format: MediaFormat,
    quality: Quality,
) -> Option<&Encoding> {
    if format.is_audio_only() {
        return encodings
            .iter()
            .filter(|encoding| encoding.has_audio && !encoding.has_video)
            .max_by(|a, b| compare_audio(a, b));
    }

    encodings
        .iter()
        .filter(|encoding| encoding.has_video)
        .filter(|encoding| encoding.container.eq_ignore_ascii_case(format.as_str()))
        .filter(|encoding| encoding.matches_quality(quality))
        .max_by_key(|encoding| {
            (
                encoding.has_audio,
                encoding.height.unwrap_or(0),
                encoding.approx_size.unwrap_or(0),
            )
        })
}

fn compare_audio(a: &Encoding, b: &Encoding) -> Ordering {
    let bitrate_a = a.bitrate.unwrap_or(0.0);
    let bitrate_b = b.bitrate.unwrap_or(0.0);
    bitrate_a
        .partial_cmp(&bitrate_b)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.approx_size.unwrap_or(0).cmp(&b.approx_size.unwrap_or(0)))
}

#[cfg(test)]
pub(crate) fn sample_encoding(
    format_id: &str,
    container: &str,
    height: Option<u32>,
    has_video: bool,
    has_audio: bool,
) -> Encoding {
    Encoding {
        format_id: format_id.into(),
        container: container.into(),
        quality: height.map(|h| format!("{h}p")),
        height,
        has_video,
        has_audio,
        approx_size: Some(1024),
        bitrate: None,
    }
}

/// Scripted extractor for pipeline tests.
#[cfg(test)]
pub(crate) struct FakeExtractor {
    pub title: String,
    pub encodings: Vec<Encoding>,
    pub payload: Vec<u8>,
    pub probe_error: Option<String>,
    pub fetch_error: Option<String>,
}

#[cfg(test)]
impl FakeExtractor {
    pub fn new(title: &str) -> Self {
        let mut audio = sample_encoding("140", "m4a", None, false, true);
        audio.bitrate = Some(128.0);
        Self {
            title: title.into(),
            encodings: vec![
                audio,
                sample_encoding("22", "mp4", Some(720), true, true),
            ],
            payload: b"fake media payload".repeat(64),
            probe_error: None,
            fetch_error: None,
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Extractor for FakeExtractor {
    async fn probe(&self, _url: &str) -> Result<MediaInfo> {
        if let Some(message) = &self.probe_error {
            anyhow::bail!("{message}");
        }
        Ok(MediaInfo {
            title: self.title.clone(),
            encodings: self.encodings.clone(),
        })
    }

    async fn fetch(
        &self,
        _url: &str,
        _encoding: &Encoding,
        dest: &Path,
        on_progress: &(dyn Fn(TransferProgress) + Send + Sync),
    ) -> Result<()> {
        let total = self.payload.len() as u64;
        // the third report goes backwards on purpose
        for downloaded in [total / 4, total / 2, total / 4, total] {
            on_progress(TransferProgress {
                downloaded,
                total: Some(total),
            });
            tokio::task::yield_now().await;
        }
        if let Some(message) = &self.fetch_error {
            anyhow::bail!("{message}");
        }
        tokio::fs::write(dest, &self.payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<Encoding> {
        let mut low_audio = sample_encoding("139", "m4a", None, false, true);
        low_audio.bitrate = Some(48.0);
        let mut high_audio = sample_encoding("251", "webm", None, false, true);
        high_audio.bitrate = Some(160.0);
        vec![
            low_audio,
            high_audio,
            sample_encoding("18", "mp4", Some(360), true, true),
            sample_encoding("22", "mp4", Some(720), true, true),
            sample_encoding("137", "mp4", Some(1080), true, false),
            sample_encoding("248", "webm", Some(1080), true, false),
            sample_encoding("244", "webm", Some(480), true, false),
        ]
    }

    fn pick(format: MediaFormat, quality: Quality) -> Option<String> {
        select_encoding(&catalog(), format, quality).map(|encoding| encoding.format_id.clone())
    }

    #[test]
    fn audio_requests_take_highest_bitrate() {
        assert_eq!(pick(MediaFormat::Mp3, Quality::Best).as_deref(), Some("251"));
        // quality is irrelevant for audio-only requests
        assert_eq!(pick(MediaFormat::Mp3, Quality::P360).as_deref(), Some("251"));
    }

    #[test]
    fn best_video_prefers_muxed_streams() {
        assert_eq!(pick(MediaFormat::Mp4, Quality::Best).as_deref(), Some("22"));
        assert_eq!(pick(MediaFormat::Webm, Quality::Best).as_deref(), Some("248"));
    }

    #[test]
    fn fixed_quality_must_match() {
        assert_eq!(pick(MediaFormat::Mp4, Quality::P1080).as_deref(), Some("137"));
        assert_eq!(pick(MediaFormat::Mp4, Quality::P360).as_deref(), Some("18"));
        assert_eq!(pick(MediaFormat::Webm, Quality::P480).as_deref(), Some("244"));
        assert_eq!(pick(MediaFormat::Webm, Quality::P720), None);
    }

    #[test]
    fn empty_catalog_yields_nothing() {
        assert!(select_encoding(&[], MediaFormat::Mp3, Quality::Best).is_none());
        let video_only = vec![sample_encoding("18", "mp4", Some(360), true, true)];
        assert!(select_encoding(&video_only, MediaFormat::Mp3, Quality::Best).is_none());
    }
}
