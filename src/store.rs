//! In-memory job table. Lives for the lifetime of the process only.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    job::{Job, JobId, JobStatus},
    validation::Submission,
};

#[derive(Clone)]
pub struct JobStore {
    inner: Arc<JobStoreInner>,
}

struct JobStoreInner {
    jobs: Mutex<HashMap<JobId, Job>>,
    counter: AtomicU64,
}

/// Finished archive handed out to exactly one caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveHandle {
    pub path: PathBuf,
    pub file_name: String,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(JobStoreInner {
                jobs: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a pending job and returns a snapshot of it.
    pub fn create(&self, submission: Submission) -> Job {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        let job = Job::new(id, submission.url, submission.format, submission.quality);
        self.inner.jobs.lock().insert(id, job.clone());
        job
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.inner.jobs.lock().get(&id).cloned()
    }

    /// Every job, newest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.id.cmp(&a.id));
        jobs
    }

    /// Runs `f` against the job while holding the table lock.
    pub fn update<R>(&self, id: JobId, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.inner.jobs.lock().get_mut(&id).map(f)
    }

    /// Detaches the archive from a completed job. A second call for the same
    /// job returns `None`, which is what makes an archive downloadable once.
    pub fn take_archive(&self, id: JobId) -> Option<ArchiveHandle> {
        let mut jobs = self.inner.jobs.lock();
        let job = jobs.get_mut(&id)?;
        if job.status != JobStatus::Completed {
            return None;
        }
        let path = job.file_path.take()?;
        let file_name = job
            .file_name
            .clone()
            .unwrap_or_else(|| format!("job-{id}.zip"));
        Some(ArchiveHandle { path, file_name })
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{MediaFormat, Quality};

    fn submission() -> Submission {
        Submission {
            url: "https://youtu.be/abc123".into(),
            format: MediaFormat::Mp3,
            quality: Quality::Best,
        }
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let store = JobStore::new();
        let first = store.create(submission());
        let second = store.create(submission());
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.status, JobStatus::Pending);
        let listed: Vec<JobId> = store.list().iter().map(|job| job.id).collect();
        assert_eq!(listed, vec![2, 1]);
    }

    #[test]
    fn update_applies_under_lock() {
        let store = JobStore::new();
        let job = store.create(submission());
        let moved = store
            .update(job.id, |job| job.advance(JobStatus::Downloading, 12))
            .unwrap();
        assert!(moved);
        assert_eq!(store.get(job.id).unwrap().progress, 12);
        assert!(store.update(999, |_| ()).is_none());
    }

    #[test]
    fn archive_is_handed_out_once_and_only_when_completed() {
        let store = JobStore::new();
        let job = store.create(submission());
        store.update(job.id, |job| {
            job.file_path = Some(PathBuf::from("/tmp/a.zip"));
            job.file_name = Some("a.zip".into());
            job.advance(JobStatus::Downloading, 0);
        });
        assert!(store.take_archive(job.id).is_none());

        store.update(job.id, |job| {
            job.advance(JobStatus::CreatingZip, 90);
            job.advance(JobStatus::Completed, 100);
        });
        let handle = store.take_archive(job.id).unwrap();
        assert_eq!(handle.path, PathBuf::from("/tmp/a.zip"));
        assert_eq!(handle.file_name, "a.zip");
        assert!(store.take_archive(job.id).is_none());
        assert!(store.take_archive(42).is_none());
    }
}
