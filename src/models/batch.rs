use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Time-to-live of a batch record and its failed-email list, in seconds.
pub const BATCH_TTL_SECS: u64 = 3600;

/// Aggregate progress of one invitation round, as held by the counter store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub batch_id: Uuid,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub failed_emails: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub question_id: Uuid,
}

impl BatchRecord {
    /// Fresh record with zeroed counters.
    pub fn new(question_id: Uuid, total: u64) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            total,
            completed: 0,
            failed: 0,
            failed_emails: Vec::new(),
            started_at: Utc::now(),
            question_id,
        }
    }

    /// Number of jobs that reached a terminal outcome.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn pending(&self) -> u64 {
        self.total.saturating_sub(self.finished())
    }

    pub fn is_done(&self) -> bool {
        self.finished() == self.total
    }

    /// Percentage of finished jobs, rounded half up. A zero-sized batch
    /// reports 0.
    pub fn progress(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let finished = self.finished().min(self.total);
        ((200 * finished + self.total) / (2 * self.total)) as u8
    }
}

/// Client-facing view of a batch returned by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub batch_id: Uuid,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub done: bool,
    pub failed_emails: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub progress: u8,
}

impl From<BatchRecord> for BatchStatus {
    fn from(record: BatchRecord) -> Self {
        Self {
            pending: record.pending(),
            done: record.is_done(),
            progress: record.progress(),
            batch_id: record.batch_id,
            total: record.total,
            completed: record.completed,
            failed: record.failed,
            failed_emails: record.failed_emails,
            started_at: record.started_at,
        }
    }
}
