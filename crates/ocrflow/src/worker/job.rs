use chrono::{DateTime, Utc};

use crate::model::{QueueEntry, Status};

/// One leased queue entry handed to a worker.
#[derive(Debug, Clone)]
pub struct OcrJob {
    pub queue_id: i64,
    pub document_id: String,
    pub priority: i32,
    pub leased_at: DateTime<Utc>,
}

impl OcrJob {
    pub fn from_entry(entry: &QueueEntry) -> Self {
        Self {
            queue_id: entry.queue_id,
            document_id: entry.document_id.clone(),
            priority: entry.priority,
            leased_at: entry.updated_at,
        }
    }
}

/// What a worker did with a job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub queue_id: i64,
    pub document_id: String,
    pub succeeded_pages: Vec<u32>,
    pub failed_pages: Vec<u32>,
    /// First page failure, also stored on the queue entry.
    pub error: Option<String>,
    /// State the queue entry was left in.
    pub entry_status: Status,
}

impl JobOutcome {
    pub fn new(job: &OcrJob) -> Self {
        Self {
            queue_id: job.queue_id,
            document_id: job.document_id.clone(),
            succeeded_pages: Vec::new(),
            failed_pages: Vec::new(),
            error: None,
            entry_status: Status::Processing,
        }
    }

    pub fn record_success(&mut self, page: u32) {
        self.succeeded_pages.push(page);
    }

    pub fn record_failure(&mut self, page: u32, error: String) {
        self.failed_pages.push(page);
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn success(&self) -> bool {
        self.entry_status == Status::Completed
    }

    /// Terminal state the entry should take given the pages seen so far, with
    /// the reason when it fails.
    pub fn resolution(&self) -> (Status, Option<String>) {
        if let Some(ref error) = self.error {
            return (Status::Failed, Some(error.clone()));
        }
        if self.succeeded_pages.is_empty() {
            return (
                Status::Failed,
                Some("no pending pages for document".to_string()),
            );
        }
        (Status::Completed, None)
    }
}
