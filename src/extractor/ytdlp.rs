use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
};
use tracing::debug;

use super::{Encoding, Extractor, MediaInfo, TransferProgress};

const PROGRESS_PREFIX: &str = "tubezip:";
const PROGRESS_TEMPLATE: &str = "download:tubezip:%(progress.downloaded_bytes)s:%(progress.total_bytes)s:%(progress.total_bytes_estimate)s";

// run the yt-dlp command line to list formats and download one of them.
// requires the executable at `binary` (or `yt-dlp` in PATH).
#[derive(Clone, Debug)]
pub struct YtDlp {
    binary: PathBuf,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for YtDlp {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

/// Minimal version of yt-dlp's `-J` output.
#[derive(Deserialize)]
struct InfoJson {
    title: Option<String>,
    #[serde(default)]
    formats: Vec<FormatEntry>,
}

#[derive(Deserialize)]
struct FormatEntry {
    format_id: String,
    #[serde(default)]
    ext: String,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    format_note: Option<String>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
    abr: Option<f64>,
    tbr: Option<f64>,
}

fn codec_present(codec: Option<&str>) -> bool {
    codec.is_some_and(|codec| !codec.is_empty() && codec != "none")
}

impl FormatEntry {
    fn into_encoding(self) -> Option<Encoding> {
        let has_video = codec_present(self.vcodec.as_deref());
        let has_audio = codec_present(self.acodec.as_deref());
        // storyboards and other non-media entries
        if !has_video && !has_audio {
            return None;
        }
        let quality = if has_video {
            self.height
                .map(|height| format!("{height}p"))
                .or(self.format_note)
        } else {
            None
        };
        Some(Encoding {
            format_id: self.format_id,
            container: self.ext,
            quality,
            height: if has_video { self.height } else { None },
            has_video,
            has_audio,
            approx_size: self.filesize.or(self.filesize_approx),
            bitrate: self.abr.or(self.tbr),
        })
    }
}

fn parse_info(raw: &[u8]) -> Result<MediaInfo> {
    let info: InfoJson = serde_json::from_slice(raw).context("parsing yt-dlp metadata")?;
    Ok(MediaInfo {
        title: info
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| "video".to_string()),
        encodings: info
            .formats
            .into_iter()
            .filter_map(FormatEntry::into_encoding)
            .collect(),
    })
}

/// Parses one line printed through [`PROGRESS_TEMPLATE`]. yt-dlp prints `NA`
/// for unknown values and floats for estimates.
fn parse_progress_line(line: &str) -> Option<TransferProgress> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let mut fields = rest.split(':').map(parse_byte_count);
    let downloaded = fields.next()??;
    let total = fields.next().flatten();
    let estimate = fields.next().flatten();
    Some(TransferProgress {
        downloaded,
        total: total.or(estimate),
    })
}

fn parse_byte_count(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(count) = value.parse::<u64>() {
        return Some(count);
    }
    value
        .parse::<f64>()
        .ok()
        .filter(|count| count.is_finite() && *count >= 0.0)
        .map(|count| count as u64)
}

fn last_error_line(stderr: &str) -> &str {
    stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no output")
        .trim()
}

#[async_trait]
impl Extractor for YtDlp {
    async fn probe(&self, url: &str) -> Result<MediaInfo> {
        let output = Command::new(&self.binary)
            .arg("-J")
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg(url)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("launching {}", self.binary.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("extraction failed for {url}: {}", last_error_line(&stderr));
        }

        parse_info(&output.stdout)
    }

    async fn fetch(
        &self,
        url: &str,
        encoding: &Encoding,
        dest: &Path,
        on_progress: &(dyn Fn(TransferProgress) + Send + Sync),
    ) -> Result<()> {
        let mut child = Command::new(&self.binary)
            .arg("-f")
            .arg(&encoding.format_id)
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-part")
            .arg("--newline")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("-o")
            .arg(dest)
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("launching {}", self.binary.display()))?;

        let stdout = child.stdout.take().context("yt-dlp stdout not captured")?;
        let mut stderr = child.stderr.take().context("yt-dlp stderr not captured")?;

        // drain stderr on the side so a chatty child never blocks on a full pipe
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(err) = stderr.read_to_end(&mut buf).await {
                debug!(error = %err, "yt-dlp stderr closed early");
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await.context("reading yt-dlp output")? {
            match parse_progress_line(&line) {
                Some(progress) => on_progress(progress),
                None => debug!(line = %line, "yt-dlp"),
            }
        }

        let status = child.wait().await.context("waiting for yt-dlp")?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            bail!(
                "download failed for format {}: {}",
                encoding.format_id,
                last_error_line(&stderr)
            );
        }
        if !tokio::fs::try_exists(dest).await.unwrap_or(false) {
            bail!("yt-dlp finished without writing {}", dest.display());
        }
        Ok(())
    }
}
