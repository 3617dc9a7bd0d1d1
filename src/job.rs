#![forbid(unsafe_code)]

//! Job record shared by the store, the runner and the HTTP layer.
//!
//! A job walks a short linear lifecycle. Every mutation goes through
//! [`Job::advance`] or [`Job::fail`] so status and progress can never move
//! backwards, no matter which task touches the record.

use std::{fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = u64;

/// Container requested by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    Mp4,
    Mp3,
    Webm,
}

impl MediaFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
            Self::Webm => "webm",
        }
    }

    /// `mp3` asks for the audio track only.
    pub fn is_audio_only(self) -> bool {
        matches!(self, Self::Mp3)
    }
}

impl FromStr for MediaFormat {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mp4" => Ok(Self::Mp4),
            "mp3" => Ok(Self::Mp3),
            "webm" => Ok(Self::Webm),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "best")]
    Best,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
            Self::P360 => "360p",
            Self::Best => "best",
        }
    }

    /// Frame height for fixed qualities, `None` for `best`.
    pub fn height(self) -> Option<u32> {
        match self {
            Self::P1080 => Some(1080),
            Self::P720 => Some(720),
            Self::P480 => Some(480),
            Self::P360 => Some(360),
            Self::Best => None,
        }
    }
}

impl FromStr for Quality {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "1080p" => Ok(Self::P1080),
            "720p" => Ok(Self::P720),
            "480p" => Ok(Self::P480),
            "360p" => Ok(Self::P360),
            "best" => Ok(Self::Best),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Downloading,
    CreatingZip,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::CreatingZip => "creating_zip",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position along the happy path. Used to reject regressions.
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Downloading => 1,
            Self::CreatingZip => 2,
            Self::Completed => 3,
            Self::Failed => 4,
        }
    }

    /// Allowed moves: one step forward along the happy path, or into
    /// `failed` from any state that has not finished yet.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => true,
            Self::Pending => false,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user-submitted request to retrieve and archive one item.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub url: String,
    pub format: MediaFormat,
    pub quality: Quality,
    pub status: JobStatus,
    pub progress: u8,
    pub file_name: Option<String>,
    pub file_size: Option<String>,
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, url: String, format: MediaFormat, quality: Quality) -> Self {
        Self {
            id,
            url,
            format,
            quality,
            status: JobStatus::Pending,
            progress: 0,
            file_name: None,
            file_size: None,
            file_path: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Moves the job to `status` and raises progress to `progress`.
    ///
    /// Returns `false` and leaves the record untouched when the transition is
    /// not allowed. Staying in the same non-terminal status is allowed and
    /// only raises progress; a lower value is ignored.
    pub fn advance(&mut self, status: JobStatus, progress: u8) -> bool {
        if status == JobStatus::Failed {
            return false;
        }
        if status != self.status && !self.status.can_transition_to(status) {
            return false;
        }
        if status == self.status && self.status.is_terminal() {
            return false;
        }

        self.status = status;
        self.progress = if status == JobStatus::Completed {
            100
        } else {
            self.progress.max(progress.min(100))
        };
        true
    }

    /// Marks the job as failed. Finished jobs are left alone.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = JobStatus::Failed;
        self.error = Some(message.into());
        true
    }
}
