//! Per-page OCR task records.
//!
//! A task moves `pending -> processing -> completed | failed`. Every write is
//! guarded on the source state, so a worker that lost its claim (timeout,
//! cancellation) cannot overwrite the recorded outcome.

use chrono::Utc;
use rusqlite::Connection;

use crate::db::{result_repo, task_repo, Database};
use crate::engine::ProgressReporter;
use crate::error::TaskError;
use crate::model::{OcrOptions, OcrResult, OcrTask, Recognition, Status};

/// Prefix of generated task ids.
pub const TASK_ID_PREFIX: &str = "page_ocr_";

pub fn new_task_id() -> String {
    format!("{}{}", TASK_ID_PREFIX, uuid::Uuid::new_v4().simple())
}

/// Inserts a pending task for a page on an open connection.
///
/// Rejects the page when it already has a completed task or an in-flight
/// one. Partial unique indexes back the check, so a concurrent insert that
/// slips past it still fails as a duplicate.
pub(crate) fn create_in(
    conn: &Connection,
    document_id: &str,
    page_number: u32,
    options: &OcrOptions,
    estimated_seconds: u32,
) -> Result<OcrTask, TaskError> {
    let duplicate = |completed| TaskError::Duplicate {
        document_id: document_id.to_string(),
        page: page_number,
        completed,
    };

    if task_repo::find_for_page_in(conn, document_id, page_number, &[Status::Completed])?.is_some()
    {
        return Err(duplicate(true));
    }
    if task_repo::find_for_page_in(
        conn,
        document_id,
        page_number,
        &[Status::Pending, Status::Processing],
    )?
    .is_some()
    {
        return Err(duplicate(false));
    }

    let now = Utc::now();
    let task = OcrTask {
        task_id: new_task_id(),
        document_id: document_id.to_string(),
        page_number,
        status: Status::Pending,
        progress: 0,
        options: options.clone(),
        result: None,
        error_message: None,
        estimated_seconds,
        started_at: None,
        completed_at: None,
        created_at: now,
        updated_at: now,
    };

    match task_repo::insert(conn, &task) {
        Ok(()) => Ok(task),
        Err(e) if e.is_unique_violation() => {
            let completed = task_repo::find_for_page_in(
                conn,
                document_id,
                page_number,
                &[Status::Completed],
            )?
            .is_some();
            Err(duplicate(completed))
        }
        Err(e) => Err(e.into()),
    }
}

/// Moves every pending task of a document to processing and returns them in
/// page order.
pub(crate) fn claim_pending_in(conn: &Connection, document_id: &str) -> Result<Vec<OcrTask>, TaskError> {
    let pending = task_repo::list_for_document(conn, document_id, Status::Pending)?;
    let mut claimed = Vec::with_capacity(pending.len());
    for task in pending {
        if task_repo::set_processing(conn, &task.task_id)? {
            if let Some(task) = task_repo::find_by_id(conn, &task.task_id)? {
                claimed.push(task);
            }
        }
    }
    Ok(claimed)
}

/// Handle to the `ocr_tasks` table.
#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Creates a pending task for a page.
    pub fn create(
        &self,
        document_id: &str,
        page_number: u32,
        options: &OcrOptions,
        estimated_seconds: u32,
    ) -> Result<OcrTask, TaskError> {
        self.db.with_tx(|conn| {
            create_in(conn, document_id, page_number, options, estimated_seconds)
        })
    }

    pub fn get(&self, task_id: &str) -> Result<Option<OcrTask>, TaskError> {
        Ok(self.db.with_conn(|conn| task_repo::find_by_id(conn, task_id))?)
    }

    /// Latest task for a page, whatever its state.
    pub fn find_for_page(&self, document_id: &str, page_number: u32) -> Result<Option<OcrTask>, TaskError> {
        Ok(self
            .db
            .with_conn(|conn| task_repo::find_latest_for_page(conn, document_id, page_number))?)
    }

    /// Pending tasks of a document, in page order.
    pub fn pending_for_document(&self, document_id: &str) -> Result<Vec<OcrTask>, TaskError> {
        Ok(self
            .db
            .with_conn(|conn| task_repo::list_for_document(conn, document_id, Status::Pending))?)
    }

    /// Atomically claims every pending task of a document.
    pub fn claim_pending_for_document(&self, document_id: &str) -> Result<Vec<OcrTask>, TaskError> {
        self.db.with_tx(|conn| claim_pending_in(conn, document_id))
    }

    pub fn set_processing(&self, task_id: &str) -> Result<bool, TaskError> {
        Ok(self.db.with_conn(|conn| task_repo::set_processing(conn, task_id))?)
    }

    /// Raises progress while processing. Lower values are ignored.
    pub fn set_progress(&self, task_id: &str, progress: u8) -> Result<bool, TaskError> {
        Ok(self
            .db
            .with_conn(|conn| task_repo::set_progress(conn, task_id, progress))?)
    }

    /// Records the recognition on a processing task.
    ///
    /// Returns `false` when the task is no longer processing.
    pub fn set_completed(&self, task_id: &str, result: &Recognition) -> Result<bool, TaskError> {
        Ok(self
            .db
            .with_conn(|conn| task_repo::set_completed(conn, task_id, result))?)
    }

    /// Completes a processing task and writes its result row in one
    /// transaction.
    ///
    /// A rejected completion writes nothing.
    pub fn complete_with_result(&self, task: &OcrTask, result: &Recognition) -> Result<bool, TaskError> {
        self.db.with_tx(|conn| {
            if !task_repo::set_completed(conn, &task.task_id, result)? {
                return Ok(false);
            }
            result_repo::insert(
                conn,
                &OcrResult {
                    result_id: format!("ocr_{}", uuid::Uuid::new_v4().simple()),
                    document_id: task.document_id.clone(),
                    page_number: task.page_number,
                    text: result.text.clone(),
                    confidence: result.confidence,
                    engine: result.engine.clone(),
                    language: result.language.clone(),
                    processing_ms: result.processing_ms,
                    created_at: Utc::now(),
                },
            )?;
            Ok(true)
        })
    }

    /// Fails a non-terminal task. Returns `false` when it was already terminal.
    pub fn set_failed(&self, task_id: &str, reason: &str) -> Result<bool, TaskError> {
        Ok(self
            .db
            .with_conn(|conn| task_repo::set_failed(conn, task_id, reason))?)
    }

    /// Fails a pending or processing task with `cancelled: <reason>`.
    ///
    /// Returns the task as it stands afterwards, and whether this call
    /// cancelled it.
    pub fn cancel(&self, task_id: &str, reason: &str) -> Result<(OcrTask, bool), TaskError> {
        self.db.with_tx(|conn| {
            let message = format!("cancelled: {}", reason);
            let changed = task_repo::set_failed(conn, task_id, &message)?;
            let task = task_repo::find_by_id(conn, task_id)?
                .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
            Ok((task, changed))
        })
    }

    /// The stored result of a page, present only once its task completed.
    pub fn result_for_page(&self, document_id: &str, page_number: u32) -> Result<Option<OcrResult>, TaskError> {
        Ok(self
            .db
            .with_conn(|conn| result_repo::find_for_page(conn, document_id, page_number))?)
    }

    pub fn count_by_status(&self, status: Status) -> Result<u64, TaskError> {
        Ok(self.db.with_conn(|conn| task_repo::count_by_status(conn, status))?)
    }

    /// Fails every task left pending or processing behind an entry that will
    /// never run again. Used at startup and for abandoned jobs.
    pub fn fail_unresolved_for_document(&self, document_id: &str, reason: &str) -> Result<usize, TaskError> {
        self.db.with_tx(|conn| {
            let mut failed = 0;
            for status in [Status::Processing, Status::Pending] {
                for task in task_repo::list_for_document(conn, document_id, status)? {
                    if task_repo::set_failed(conn, &task.task_id, reason)? {
                        failed += 1;
                    }
                }
            }
            Ok(failed)
        })
    }

    /// Fails every task left `processing` by a previous run.
    pub fn fail_interrupted(&self, reason: &str) -> Result<usize, TaskError> {
        self.db.with_tx(|conn| {
            let mut failed = 0;
            for task in task_repo::list_by_status(conn, Status::Processing)? {
                if task_repo::set_failed(conn, &task.task_id, reason)? {
                    failed += 1;
                }
            }
            Ok(failed)
        })
    }
}

impl ProgressReporter for TaskStore {
    fn report(&self, task_id: &str, percent: u8) {
        match self.set_progress(task_id, percent) {
            Ok(true) => {}
            Ok(false) => log::debug!("Ignored progress {}% for task {} (not processing)", percent, task_id),
            Err(e) => log::warn!("Failed to record progress for task {}: {}", task_id, e),
        }
    }
}
