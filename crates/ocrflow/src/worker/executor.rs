use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tracing::Instrument;

use super::job::{JobOutcome, OcrJob};
use super::registry::CancelRegistry;
use crate::db::{queue_repo, Database};
use crate::document::DocumentStore;
use crate::engine::{JobContext, OcrEngine};
use crate::error::{EngineError, TaskError};
use crate::model::{OcrTask, Recognition, Status};
use crate::queue::ProcessingQueue;
use crate::tasks::{claim_pending_in, TaskStore};

/// Runs leased jobs: recognizes every pending page of the entry's document
/// and records the outcome on tasks, queue entry and document.
///
/// Never retries. A failed page stays failed until a new request creates a
/// new task for it.
pub struct Worker {
    db: Database,
    queue: ProcessingQueue,
    tasks: TaskStore,
    documents: Arc<dyn DocumentStore>,
    engine: Arc<dyn OcrEngine>,
    registry: Arc<CancelRegistry>,
    job_timeout: Duration,
}

impl Worker {
    pub fn new(
        db: Database,
        documents: Arc<dyn DocumentStore>,
        engine: Arc<dyn OcrEngine>,
        registry: Arc<CancelRegistry>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            queue: ProcessingQueue::new(db.clone()),
            tasks: TaskStore::new(db.clone()),
            db,
            documents,
            engine,
            registry,
            job_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<CancelRegistry> {
        &self.registry
    }

    /// Processes one leased entry to completion.
    pub async fn run_job(&self, job: &OcrJob) -> JobOutcome {
        let span = tracing::info_span!(
            "worker.job",
            queue_id = job.queue_id,
            document_id = %job.document_id
        );
        self.run_job_inner(job).instrument(span).await
    }

    async fn run_job_inner(&self, job: &OcrJob) -> JobOutcome {
        let mut outcome = JobOutcome::new(job);

        match self.queue.get(job.queue_id) {
            Ok(Some(entry)) if entry.status == Status::Processing => {}
            Ok(Some(entry)) => {
                warn!(
                    "Queue entry {} is {}, not processing; skipping",
                    job.queue_id, entry.status
                );
                outcome.entry_status = entry.status;
                return outcome;
            }
            Ok(None) => {
                error!("Queue entry {} disappeared", job.queue_id);
                outcome.entry_status = Status::Failed;
                return outcome;
            }
            Err(e) => {
                // Leave the entry as is; startup recovery fails it.
                error!("Failed to load queue entry {}: {}", job.queue_id, e);
                outcome.error = Some(e.to_string());
                return outcome;
            }
        }

        let mut batch = match self.tasks.claim_pending_for_document(&job.document_id) {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to claim tasks of {}: {}", job.document_id, e);
                outcome.record_failure(0, e.to_string());
                Vec::new()
            }
        };

        loop {
            for task in &batch {
                match self.process_task(task).await {
                    Ok(()) => outcome.record_success(task.page_number),
                    Err(message) => outcome.record_failure(task.page_number, message),
                }
            }

            // Pick up pages requested while this job ran, or resolve the entry
            // in the same transaction so none can slip in between.
            let (status, reason) = outcome.resolution();
            let step = self.db.with_tx(|conn| {
                let more = claim_pending_in(conn, &job.document_id)?;
                if !more.is_empty() {
                    return Ok::<_, TaskError>(Resolution::More(more));
                }
                let changed = queue_repo::transition(
                    conn,
                    job.queue_id,
                    &[Status::Processing],
                    status,
                    reason.as_deref(),
                )?;
                Ok(Resolution::Resolved(changed))
            });

            match step {
                Ok(Resolution::More(more)) => {
                    debug!(
                        "Document {} gained {} page(s) while processing",
                        job.document_id,
                        more.len()
                    );
                    batch = more;
                }
                Ok(Resolution::Resolved(changed)) => {
                    if changed {
                        outcome.entry_status = status;
                    } else {
                        warn!("Queue entry {} was resolved elsewhere", job.queue_id);
                        if let Ok(Some(entry)) = self.queue.get(job.queue_id) {
                            outcome.entry_status = entry.status;
                        }
                    }
                    break;
                }
                Err(e) => {
                    error!("Failed to resolve queue entry {}: {}", job.queue_id, e);
                    if let Err(e) = self.queue.mark_failed(job.queue_id, &e.to_string()) {
                        error!("Failed to mark queue entry {} failed: {}", job.queue_id, e);
                    }
                    outcome.entry_status = Status::Failed;
                    break;
                }
            }
        }

        info!(
            "Job for {} finished: entry {} ({} page(s) ok, {} failed)",
            job.document_id,
            outcome.entry_status,
            outcome.succeeded_pages.len(),
            outcome.failed_pages.len()
        );
        outcome
    }

    /// Recognizes one claimed task. Returns the failure message on error.
    async fn process_task(&self, task: &OcrTask) -> Result<(), String> {
        // Register before re-reading the task: a cancel that lands after
        // this point raises the flag, one that landed before shows in storage.
        let flag = self.registry.register(&task.task_id);
        if let Some(reason) = self.resolved_elsewhere(task) {
            self.registry.remove(&task.task_id);
            debug!("Skipping task {}: {}", task.task_id, reason);
            return Err(reason);
        }

        let ctx = JobContext::new(
            &task.task_id,
            self.job_timeout,
            flag.clone(),
            Arc::new(self.tasks.clone()),
        );
        let result = self.recognize(task, &ctx).await;
        self.registry.remove(&task.task_id);

        match result {
            Ok(recognition) => self.record_success(task, &recognition),
            Err(e) => {
                let message = e.to_string();
                self.record_failure(task, &message);
                Err(message)
            }
        }
    }

    /// The recorded outcome of a task that left `processing` after it was
    /// claimed, e.g. through `cancel_task`.
    fn resolved_elsewhere(&self, task: &OcrTask) -> Option<String> {
        match self.tasks.get(&task.task_id) {
            Ok(Some(current)) if current.status != Status::Processing => Some(
                current
                    .error_message
                    .unwrap_or_else(|| format!("task is already {}", current.status)),
            ),
            Ok(Some(_)) => None,
            Ok(None) => Some("task record disappeared".to_string()),
            Err(e) => {
                warn!("Failed to re-read task {}: {}", task.task_id, e);
                None
            }
        }
    }

    async fn recognize(&self, task: &OcrTask, ctx: &JobContext) -> Result<Recognition, EngineError> {
        // Flags raised before the call (shutdown) never reach the engine.
        ctx.check()?;
        ctx.report_progress(5);
        let page = self
            .documents
            .load_page(&task.document_id, task.page_number)
            .map_err(|e| EngineError::Failed(e.to_string()))?;
        ctx.report_progress(10);

        let result = tokio::select! {
            r = tokio::time::timeout(ctx.remaining(), self.engine.recognize(&page, &task.options, ctx)) => {
                match r {
                    Ok(r) => r,
                    Err(_) => Err(EngineError::TimedOut(self.job_timeout)),
                }
            }
            _ = ctx.cancel.cancelled() => Err(EngineError::Cancelled(
                ctx.cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            )),
        };

        match result {
            Err(EngineError::TimedOut(_)) => {
                warn!(
                    "OCR of {} page {} timed out after {:?}",
                    task.document_id, task.page_number, self.job_timeout
                );
                ctx.cancel.cancel("timed out");
                Err(EngineError::TimedOut(self.job_timeout))
            }
            other => other,
        }
    }

    fn record_success(&self, task: &OcrTask, recognition: &Recognition) -> Result<(), String> {
        if recognition.confidence < task.options.confidence as f64 {
            debug!(
                "Task {} confidence {:.1} below requested {}",
                task.task_id, recognition.confidence, task.options.confidence
            );
        }

        match self.tasks.complete_with_result(task, recognition) {
            Ok(true) => {}
            Ok(false) => {
                let message = self
                    .tasks
                    .get(&task.task_id)
                    .ok()
                    .flatten()
                    .and_then(|t| t.error_message)
                    .unwrap_or_else(|| "task is no longer processing".to_string());
                warn!("Discarded late result for task {}: {}", task.task_id, message);
                return Err(message);
            }
            Err(e) => {
                error!("Failed to store result of task {}: {}", task.task_id, e);
                let message = format!("failed to store result: {}", e);
                self.record_failure(task, &message);
                return Err(message);
            }
        }

        if let Err(e) =
            self.documents
                .mark_processed(&task.document_id, task.page_number, &recognition.text)
        {
            error!(
                "Failed to flag document {} processed: {}",
                task.document_id, e
            );
        }
        Ok(())
    }

    fn record_failure(&self, task: &OcrTask, message: &str) {
        match self.tasks.set_failed(&task.task_id, message) {
            Ok(true) => {}
            Ok(false) => debug!("Task {} already terminal", task.task_id),
            Err(e) => error!("Failed to mark task {} failed: {}", task.task_id, e),
        }
        if let Err(e) = self.documents.mark_failed(&task.document_id, message) {
            error!("Failed to flag document {} failed: {}", task.document_id, e);
        }
    }

    /// Fails a job that will never run, together with its unresolved tasks.
    pub fn abandon(&self, job: &OcrJob, reason: &str) {
        warn!("Abandoning job for {}: {}", job.document_id, reason);
        if let Err(e) = self.queue.mark_failed(job.queue_id, reason) {
            error!("Failed to mark queue entry {} failed: {}", job.queue_id, e);
        }
        if let Err(e) = self.tasks.fail_unresolved_for_document(&job.document_id, reason) {
            error!("Failed to fail tasks of {}: {}", job.document_id, e);
        }
    }

    /// Fails entries and tasks a previous process left mid-flight.
    pub fn recover_interrupted(&self) -> Result<usize, TaskError> {
        let reason = "interrupted before completion";
        let entries = self.queue.fail_interrupted(reason)?;
        for entry in &entries {
            self.tasks
                .fail_unresolved_for_document(&entry.document_id, reason)?;
        }
        let stray = self.tasks.fail_interrupted(reason)?;
        if !entries.is_empty() || stray > 0 {
            warn!(
                "Recovered {} interrupted queue entr(ies) and {} task(s)",
                entries.len(),
                stray
            );
        }
        Ok(entries.len())
    }
}

enum Resolution {
    More(Vec<OcrTask>),
    Resolved(bool),
}
