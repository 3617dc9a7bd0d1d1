//! Background pipeline: one tokio task per submitted job.
//!
//! Each task downloads the chosen encoding into a scratch directory, zips it
//! and records the result. Every state change is written to the store first
//! and then pushed to listeners, so frames for one job leave in the order
//! the transitions happened.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::{
    archive::{create_archive, format_size, sanitize_file_name},
    extractor::{Extractor, TransferProgress, select_encoding},
    job::{Job, JobId, JobStatus},
    notifier::{Notifier, ProgressFrame},
    store::JobStore,
    validation::Submission,
};

/// Share of the progress bar given to the transfer itself.
const DOWNLOAD_BUDGET: u64 = 80;
const ARCHIVING_PROGRESS: u8 = 90;

#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<JobRunnerInner>,
}

struct JobRunnerInner {
    store: JobStore,
    notifier: Notifier,
    extractor: Arc<dyn Extractor>,
    download_root: PathBuf,
}

impl JobRunner {
    pub fn new(
        store: JobStore,
        notifier: Notifier,
        extractor: Arc<dyn Extractor>,
        download_root: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(JobRunnerInner {
                store,
                notifier,
                extractor,
                download_root,
            }),
        }
    }

    /// Creates a pending job and starts working on it in the background.
    /// Must be called from inside a tokio runtime.
    pub fn submit(&self, submission: Submission) -> Job {
        let job = self.inner.store.create(submission);
        info!(job_id = job.id, url = %job.url, format = %job.format, quality = %job.quality, "job submitted");

        let inner = self.inner.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            inner.run(job_id).await;
        });

        job
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }
}

impl JobRunnerInner {
    async fn run(&self, id: JobId) {
        let scratch = self.scratch_dir(id);
        if let Err(err) = self.execute(id, &scratch).await {
            let message = format!("{err:#}");
            warn!(job_id = id, error = %message, "job failed");
            self.transition(id, |job| job.fail(message));
            if let Err(err) = tokio::fs::remove_dir_all(&scratch).await
                && err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(job_id = id, error = %err, "could not clean scratch directory");
            }
        }
    }

    async fn execute(&self, id: JobId, scratch: &Path) -> Result<()> {
        let job = self
            .store
            .get(id)
            .with_context(|| format!("job {id} vanished"))?;

        self.transition(id, |job| job.advance(JobStatus::Downloading, 0));

        let info = self.extractor.probe(&job.url).await?;
        let encoding = select_encoding(&info.encodings, job.format, job.quality)
            .with_context(|| {
                format!(
                    "no matching encoding for format {} at quality {}",
                    job.format, job.quality
                )
            })?
            .clone();
        debug!(job_id = id, format_id = %encoding.format_id, container = %encoding.container, "encoding selected");

        tokio::fs::create_dir_all(scratch)
            .await
            .with_context(|| format!("creating {}", scratch.display()))?;

        let stem = sanitize_file_name(&info.title);
        let dest = scratch.join(format!("{stem}.{}", encoding.container));
        let on_progress = |progress: TransferProgress| {
            let percent = download_percent(progress);
            self.transition(id, |job| {
                percent > job.progress && job.advance(JobStatus::Downloading, percent)
            });
        };
        self.extractor
            .fetch(&job.url, &encoding, &dest, &on_progress)
            .await?;

        self.transition(id, |job| {
            job.advance(JobStatus::CreatingZip, ARCHIVING_PROGRESS)
        });

        let archive_path = self.download_root.join(format!("{stem}-{id}.zip"));
        let source = scratch.to_path_buf();
        let summary = tokio::task::spawn_blocking(move || create_archive(&source, &archive_path))
            .await
            .context("archive task aborted")??;

        let file_size = format_size(summary.size);
        info!(job_id = id, path = %summary.path.display(), size = %file_size, "job completed");
        self.transition(id, |job| {
            job.file_name = Some(format!("{stem}.zip"));
            job.file_size = Some(file_size);
            job.file_path = Some(summary.path);
            job.advance(JobStatus::Completed, 100)
        });

        Ok(())
    }

    /// Applies `f` to the job and pushes a frame when it reports a change.
    fn transition(&self, id: JobId, f: impl FnOnce(&mut Job) -> bool) {
        let frame = self
            .store
            .update(id, |job| f(&mut *job).then(|| ProgressFrame::from(&*job)))
            .flatten();
        if let Some(frame) = frame {
            self.notifier.publish(frame);
        }
    }

    fn scratch_dir(&self, id: JobId) -> PathBuf {
        self.download_root.join(format!("job-{id}"))
    }
}

/// Maps transferred bytes onto the first 80 points of the progress bar.
fn download_percent(progress: TransferProgress) -> u8 {
    match progress.total {
        Some(total) if total > 0 => {
            let downloaded = progress.downloaded.min(total) as u128;
            (downloaded * DOWNLOAD_BUDGET as u128 / total as u128) as u8
        }
        _ => 0,
    }
}
