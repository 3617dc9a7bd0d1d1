//! Fan-out push channel. Every listener sees every job's frames.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{Job, JobId, JobStatus};

const CHANNEL_CAPACITY: usize = 256;

/// Wire frame pushed to browsers on each state change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressFrame {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for ProgressFrame {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            error: job.error.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<ProgressFrame>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, frame: ProgressFrame) {
        // No listeners is fine.
        let _ = self.tx.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressFrame> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
