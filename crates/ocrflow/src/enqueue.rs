//! Entry point for OCR requests.
//!
//! A request creates one pending task for the page and, when the document
//! has no active queue entry, one pending entry. Both inserts share a
//! transaction; the partial unique indexes on `ocr_tasks` and
//! `processing_queue` decide races between concurrent requests. Batches
//! and the read-side queries (history, statistics) live here too.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::batch::{new_batch_id, BatchItem, BatchReceipt, BatchRecord, BatchRequest, BatchStatus};
use crate::config::OcrDefaults;
use crate::db::result_repo::{self, Breakdown};
use crate::db::{batch_repo, queue_repo, task_repo, Database};
use crate::document::DocumentStore;
use crate::error::EnqueueError;
use crate::model::{
    validate_document_id, DocumentOcrStats, OcrRequest, OcrResult, OcrTask, PageRef, Status,
};
use crate::tasks::{create_in, TaskStore};
use crate::worker::CancelRegistry;

/// Default queue priority for new entries.
pub const DEFAULT_PRIORITY: i32 = 1;

/// Acknowledgement of an accepted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReceipt {
    pub task_id: String,
    pub status: Status,
    pub progress: u8,
    /// Seconds.
    pub estimated_time: u32,
}

#[derive(Clone)]
pub struct EnqueueService {
    db: Database,
    tasks: TaskStore,
    documents: Arc<dyn DocumentStore>,
    registry: Arc<CancelRegistry>,
    defaults: OcrDefaults,
}

impl EnqueueService {
    pub fn new(
        db: Database,
        documents: Arc<dyn DocumentStore>,
        registry: Arc<CancelRegistry>,
        defaults: OcrDefaults,
    ) -> Self {
        Self {
            tasks: TaskStore::new(db.clone()),
            db,
            documents,
            registry,
            defaults,
        }
    }

    /// Requests OCR of one page.
    ///
    /// Checks run in order: well-formed request, document exists, page not
    /// already processed, page not already in flight.
    pub fn request_processing(
        &self,
        document_id: &str,
        page_number: i64,
        request: &OcrRequest,
    ) -> Result<EnqueueReceipt, EnqueueError> {
        let page = PageRef::new(document_id, page_number)?;
        let options = request.resolve(&self.defaults)?;
        let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);

        if !self.documents.exists(&page.document_id)? {
            return Err(EnqueueError::NotFound(format!(
                "document '{}'",
                page.document_id
            )));
        }

        let estimated_seconds = self.defaults.estimated_seconds;
        let (task, queue_id) = self.db.with_tx(|conn| {
            let task = create_in(
                conn,
                &page.document_id,
                page.page_number,
                &options,
                estimated_seconds,
            )?;

            // An active entry picks the new task up, either at lease or
            // through the worker's re-claim before it resolves.
            let queue_id = match queue_repo::find_active_for_document(conn, &page.document_id)? {
                Some(_) => None,
                None => match queue_repo::insert(conn, &page.document_id, priority) {
                    Ok(id) => Some(id),
                    Err(e) if e.is_unique_violation() => None,
                    Err(e) => return Err(EnqueueError::from(e)),
                },
            };
            Ok::<_, EnqueueError>((task, queue_id))
        })?;

        match queue_id {
            Some(id) => log::info!(
                "Queued OCR task {} for {} (queue entry {}, priority {})",
                task.task_id,
                page,
                id,
                priority
            ),
            None => log::info!(
                "Queued OCR task {} for {} behind the document's active entry",
                task.task_id,
                page
            ),
        }

        Ok(EnqueueReceipt {
            task_id: task.task_id,
            status: task.status,
            progress: task.progress,
            estimated_time: task.estimated_seconds,
        })
    }

    /// Requests OCR of many pages in one call.
    ///
    /// The whole batch is refused when it is malformed or names an unknown
    /// document. Past that point every page goes through
    /// [`request_processing`](Self::request_processing) on its own, and a
    /// page it refuses becomes a skipped item carrying the reason.
    pub fn request_batch(&self, request: &BatchRequest) -> Result<BatchReceipt, EnqueueError> {
        let plan = request.plan()?;
        request.options.resolve(&self.defaults)?;

        // The plan keeps each document's pages together.
        let mut documents: Vec<&str> = Vec::new();
        for page in &plan {
            if documents.last() != Some(&page.document_id.as_str()) {
                documents.push(&page.document_id);
            }
        }
        let mut missing = Vec::new();
        for document_id in &documents {
            if !self.documents.exists(document_id)? {
                missing.push(*document_id);
            }
        }
        if !missing.is_empty() {
            return Err(EnqueueError::NotFound(format!(
                "documents {}",
                missing.join(", ")
            )));
        }

        let record = BatchRecord {
            batch_id: new_batch_id(),
            total_documents: documents.len() as u32,
            total_pages: plan.len() as u32,
            estimated_seconds: self.defaults.estimated_seconds,
            created_at: Utc::now(),
        };
        self.db.with_conn(|conn| batch_repo::insert(conn, &record))?;

        let mut items = Vec::with_capacity(plan.len());
        let mut queued = 0u32;
        let mut estimated_time = 0u32;
        for page in &plan {
            let mut item = BatchItem {
                document_id: page.document_id.clone(),
                page: page.page_number,
                task_id: None,
                status: None,
                error: None,
            };
            match self.request_processing(&page.document_id, i64::from(page.page_number), &request.options) {
                Ok(receipt) => {
                    self.db.with_conn(|conn| {
                        batch_repo::link_task(conn, &record.batch_id, &receipt.task_id)
                    })?;
                    queued += 1;
                    estimated_time = estimated_time.saturating_add(receipt.estimated_time);
                    item.task_id = Some(receipt.task_id);
                    item.status = Some(receipt.status);
                }
                Err(e) => {
                    if e.is_transient() {
                        log::warn!("Batch {} could not queue {}: {}", record.batch_id, page, e);
                    }
                    if matches!(
                        e,
                        EnqueueError::AlreadyProcessed { .. } | EnqueueError::InProgress { .. }
                    ) {
                        if let Ok(Some(existing)) =
                            self.tasks.find_for_page(&page.document_id, page.page_number)
                        {
                            item.task_id = Some(existing.task_id);
                            item.status = Some(existing.status);
                        }
                    }
                    item.error = Some(e.to_string());
                }
            }
            items.push(item);
        }

        let skipped = record.total_pages - queued;
        log::info!(
            "Batch {} queued {} of {} pages across {} documents ({} skipped)",
            record.batch_id,
            queued,
            record.total_pages,
            record.total_documents,
            skipped
        );

        Ok(BatchReceipt {
            batch_id: record.batch_id,
            total_documents: record.total_documents,
            total_pages: record.total_pages,
            queued,
            skipped,
            estimated_time,
            items,
        })
    }

    /// Aggregate state of a batch.
    pub fn batch_status(&self, batch_id: &str) -> Result<BatchStatus, EnqueueError> {
        let status = self.db.with_conn(|conn| {
            let Some(record) = batch_repo::find_by_id(conn, batch_id)? else {
                return Ok(None);
            };
            let counts = batch_repo::count_tasks_by_status(conn, batch_id)?;
            let average = batch_repo::average_confidence(conn, batch_id)?;
            Ok(Some(BatchStatus::from_counts(&record, &counts, average)))
        })?;
        status.ok_or_else(|| EnqueueError::NotFound(format!("OCR batch '{}'", batch_id)))
    }

    /// Latest task of a page.
    pub fn task_status(&self, document_id: &str, page_number: i64) -> Result<OcrTask, EnqueueError> {
        let page = PageRef::new(document_id, page_number)?;
        self.tasks
            .find_for_page(&page.document_id, page.page_number)?
            .ok_or_else(|| EnqueueError::NotFound(format!("OCR task for page {}", page)))
    }

    pub fn task_by_id(&self, task_id: &str) -> Result<OcrTask, EnqueueError> {
        self.tasks
            .get(task_id)?
            .ok_or_else(|| EnqueueError::NotFound(format!("OCR task '{}'", task_id)))
    }

    /// Every task of a document, newest first, optionally for one page.
    pub fn task_history(
        &self,
        document_id: &str,
        page_number: Option<i64>,
    ) -> Result<Vec<OcrTask>, EnqueueError> {
        let page_number = match page_number {
            Some(page) => Some(PageRef::new(document_id, page)?.page_number),
            None => {
                validate_document_id(document_id)?;
                None
            }
        };
        self.require_document(document_id)?;
        Ok(self
            .db
            .with_conn(|conn| task_repo::list_history(conn, document_id, page_number))?)
    }

    /// Task counts and recognition totals of a document.
    pub fn statistics(&self, document_id: &str) -> Result<DocumentOcrStats, EnqueueError> {
        validate_document_id(document_id)?;
        self.require_document(document_id)?;

        Ok(self.db.with_conn(|conn| {
            let summary = result_repo::summary_for_document(conn, document_id)?;
            let counts = task_repo::count_for_document(conn, document_id)?;
            let count = |status: Status| {
                counts
                    .iter()
                    .find(|(s, _)| *s == status)
                    .map_or(0, |(_, n)| *n)
            };
            Ok(DocumentOcrStats {
                document_id: document_id.to_string(),
                processed_pages: summary.pages,
                average_confidence: summary.average_confidence,
                total_processing_ms: summary.processing_ms,
                pending_tasks: count(Status::Pending),
                processing_tasks: count(Status::Processing),
                completed_tasks: count(Status::Completed),
                failed_tasks: count(Status::Failed),
                languages: result_repo::distribution(conn, document_id, Breakdown::Language)?,
                engines: result_repo::distribution(conn, document_id, Breakdown::Engine)?,
                daily: result_repo::daily_for_document(conn, document_id)?,
            })
        })?)
    }

    fn require_document(&self, document_id: &str) -> Result<(), EnqueueError> {
        if self.documents.exists(document_id)? {
            Ok(())
        } else {
            Err(EnqueueError::NotFound(format!("document '{}'", document_id)))
        }
    }

    /// Recognized text of a page; `NotFound` until its task completed.
    pub fn result(&self, document_id: &str, page_number: i64) -> Result<OcrResult, EnqueueError> {
        let page = PageRef::new(document_id, page_number)?;
        let not_found = || EnqueueError::NotFound(format!("OCR result for page {}", page));

        let task = self
            .tasks
            .find_for_page(&page.document_id, page.page_number)?
            .ok_or_else(not_found)?;
        if task.status != Status::Completed {
            return Err(not_found());
        }
        self.tasks
            .result_for_page(&page.document_id, page.page_number)?
            .ok_or_else(not_found)
    }

    /// Cancels a pending or processing task and interrupts it if running.
    pub fn cancel_task(&self, task_id: &str, reason: &str) -> Result<OcrTask, EnqueueError> {
        let reason = reason.trim();
        let reason = if reason.is_empty() { "cancelled by user" } else { reason };

        let (task, changed) = self.tasks.cancel(task_id, reason)?;
        if !changed {
            return Err(EnqueueError::InvalidRequest(format!(
                "OCR task '{}' is already {}",
                task_id, task.status
            )));
        }

        if self.registry.cancel(task_id, reason) {
            log::info!("Interrupted running OCR task {}: {}", task_id, reason);
        } else {
            log::info!("Cancelled OCR task {}: {}", task_id, reason);
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::SqliteDocumentStore;
    use crate::model::Recognition;
    use crate::queue::ProcessingQueue;

    struct Fixture {
        db: Database,
        service: EnqueueService,
        registry: Arc<CancelRegistry>,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let documents = SqliteDocumentStore::new(db.clone());
        documents.insert_document("doc-1", "Doc", None, 3).unwrap();
        let registry = Arc::new(CancelRegistry::new());
        let service = EnqueueService::new(
            db.clone(),
            Arc::new(documents),
            registry.clone(),
            OcrDefaults::default(),
        );
        Fixture {
            db,
            service,
            registry,
        }
    }

    fn complete(db: &Database, task_id: &str) {
        let tasks = TaskStore::new(db.clone());
        assert!(tasks.set_processing(task_id).unwrap());
        let task = tasks.get(task_id).unwrap().unwrap();
        let recognition = Recognition {
            text: "hello".to_string(),
            confidence: 99.0,
            engine: "test".to_string(),
            language: "zh".to_string(),
            processing_ms: 3,
        };
        assert!(tasks.complete_with_result(&task, &recognition).unwrap());
    }

    #[test]
    fn test_request_creates_task_and_entry() {
        let f = fixture();
        let receipt = f
            .service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap();

        assert!(receipt.task_id.starts_with("page_ocr_"));
        assert_eq!(receipt.status, Status::Pending);
        assert_eq!(receipt.progress, 0);
        assert_eq!(receipt.estimated_time, 15);

        let entry = ProcessingQueue::new(f.db.clone())
            .active_for_document("doc-1")
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, Status::Pending);
        assert_eq!(entry.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn test_second_page_shares_entry() {
        let f = fixture();
        f.service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap();
        f.service
            .request_processing("doc-1", 2, &OcrRequest::default())
            .unwrap();

        let queue = ProcessingQueue::new(f.db.clone());
        assert_eq!(queue.count_by_status(Status::Pending).unwrap(), 1);
    }

    #[test]
    fn test_options_and_priority() {
        let f = fixture();
        let request = OcrRequest {
            language: Some("en".to_string()),
            confidence: Some(90),
            priority: Some(7),
            ..Default::default()
        };
        let receipt = f.service.request_processing("doc-1", 1, &request).unwrap();

        let task = f.service.task_by_id(&receipt.task_id).unwrap();
        assert_eq!(task.options.language, "en");
        assert_eq!(task.options.confidence, 90);
        assert!(task.options.preprocess);

        let entry = ProcessingQueue::new(f.db.clone())
            .active_for_document("doc-1")
            .unwrap()
            .unwrap();
        assert_eq!(entry.priority, 7);
    }

    #[test]
    fn test_invalid_requests() {
        let f = fixture();
        for (doc, page) in [("doc-1", 0), ("doc-1", -3), ("", 1), ("bad\nid", 1)] {
            let err = f
                .service
                .request_processing(doc, page, &OcrRequest::default())
                .unwrap_err();
            assert!(matches!(err, EnqueueError::InvalidRequest(_)), "{doc:?} {page}");
        }

        let request = OcrRequest {
            confidence: Some(101),
            ..Default::default()
        };
        let err = f.service.request_processing("doc-1", 1, &request).unwrap_err();
        assert!(matches!(err, EnqueueError::InvalidRequest(_)));
    }

    #[test]
    fn test_unknown_document() {
        let f = fixture();
        let err = f
            .service
            .request_processing("missing", 1, &OcrRequest::default())
            .unwrap_err();
        assert!(matches!(err, EnqueueError::NotFound(_)));
        assert_eq!(
            ProcessingQueue::new(f.db.clone())
                .count_by_status(Status::Pending)
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_in_progress_rejected() {
        let f = fixture();
        f.service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap();
        let err = f
            .service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap_err();
        assert!(matches!(err, EnqueueError::InProgress { page: 1, .. }));
    }

    #[test]
    fn test_already_processed_rejected() {
        let f = fixture();
        let receipt = f
            .service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap();
        complete(&f.db, &receipt.task_id);

        let err = f
            .service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap_err();
        assert!(matches!(err, EnqueueError::AlreadyProcessed { page: 1, .. }));
    }

    #[test]
    fn test_failed_page_can_be_retried() {
        let f = fixture();
        let first = f
            .service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap();
        f.service.cancel_task(&first.task_id, "stop").unwrap();

        let second = f
            .service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap();
        assert_ne!(first.task_id, second.task_id);
        assert_eq!(
            f.service.task_status("doc-1", 1).unwrap().task_id,
            second.task_id
        );
    }

    #[test]
    fn test_status_and_result_lookup() {
        let f = fixture();
        assert!(matches!(
            f.service.task_status("doc-1", 1),
            Err(EnqueueError::NotFound(_))
        ));

        let receipt = f
            .service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap();
        assert_eq!(
            f.service.task_status("doc-1", 1).unwrap().status,
            Status::Pending
        );
        assert!(matches!(
            f.service.result("doc-1", 1),
            Err(EnqueueError::NotFound(_))
        ));

        complete(&f.db, &receipt.task_id);
        let result = f.service.result("doc-1", 1).unwrap();
        assert_eq!(result.text, "hello");
        assert_eq!(result.page_number, 1);
    }

    #[test]
    fn test_cancel_task() {
        let f = fixture();
        let receipt = f
            .service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap();
        let flag = f.registry.register(&receipt.task_id);

        let task = f.service.cancel_task(&receipt.task_id, "user request").unwrap();
        assert_eq!(task.status, Status::Failed);
        assert_eq!(task.error_message.as_deref(), Some("cancelled: user request"));
        assert!(flag.is_cancelled());

        let err = f.service.cancel_task(&receipt.task_id, "again").unwrap_err();
        assert!(matches!(err, EnqueueError::InvalidRequest(_)));

        let err = f.service.cancel_task("page_ocr_missing", "x").unwrap_err();
        assert!(matches!(err, EnqueueError::NotFound(_)));
    }

    #[test]
    fn test_batch_queues_each_page() {
        let f = fixture();
        SqliteDocumentStore::new(f.db.clone())
            .insert_document("doc-2", "Second", None, 5)
            .unwrap();
        let first = f
            .service
            .request_processing("doc-1", 2, &OcrRequest::default())
            .unwrap();

        let request: BatchRequest = serde_json::from_str(
            r#"{"documentIds":["doc-1","doc-2"],"pages":{"doc-1":[1,2]},"language":"en"}"#,
        )
        .unwrap();
        let receipt = f.service.request_batch(&request).unwrap();

        assert!(receipt.batch_id.starts_with("batch_ocr_"));
        assert_eq!(receipt.total_documents, 2);
        assert_eq!(receipt.total_pages, 3);
        assert_eq!(receipt.queued, 2);
        assert_eq!(receipt.skipped, 1);
        assert_eq!(receipt.estimated_time, 30);

        let in_flight = &receipt.items[1];
        assert_eq!((in_flight.document_id.as_str(), in_flight.page), ("doc-1", 2));
        assert_eq!(in_flight.task_id.as_deref(), Some(first.task_id.as_str()));
        assert!(in_flight.error.as_deref().unwrap().contains("already queued"));

        let queued = receipt.items[2].task_id.as_deref().unwrap();
        assert_eq!(f.service.task_by_id(queued).unwrap().options.language, "en");
        assert_eq!(f.service.task_status("doc-2", 1).unwrap().task_id, queued);

        let status = f.service.batch_status(&receipt.batch_id).unwrap();
        assert_eq!(status.total_tasks, 2);
        assert_eq!(status.pending, 2);
        assert_eq!(status.status, Status::Pending);
        assert_eq!(status.estimated_remaining, 30);

        complete(&f.db, receipt.items[0].task_id.as_deref().unwrap());
        let status = f.service.batch_status(&receipt.batch_id).unwrap();
        assert_eq!(status.status, Status::Processing);
        assert_eq!(status.progress, 50);
        assert_eq!(status.average_confidence, Some(99.0));
    }

    #[test]
    fn test_batch_refuses_unknown_documents_whole() {
        let f = fixture();
        let request: BatchRequest =
            serde_json::from_str(r#"{"documentIds":["doc-1","ghost","phantom"]}"#).unwrap();
        let err = f.service.request_batch(&request).unwrap_err();
        match err {
            EnqueueError::NotFound(message) => {
                assert!(message.contains("ghost") && message.contains("phantom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            f.service.task_status("doc-1", 1),
            Err(EnqueueError::NotFound(_))
        ));

        let empty = BatchRequest::default();
        assert!(matches!(
            f.service.request_batch(&empty),
            Err(EnqueueError::InvalidRequest(_))
        ));

        assert!(matches!(
            f.service.batch_status("batch_ocr_missing"),
            Err(EnqueueError::NotFound(_))
        ));
    }

    #[test]
    fn test_history_lists_every_attempt() {
        let f = fixture();
        let first = f
            .service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap();
        f.service.cancel_task(&first.task_id, "stop").unwrap();
        let second = f
            .service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap();
        f.service
            .request_processing("doc-1", 3, &OcrRequest::default())
            .unwrap();

        assert_eq!(f.service.task_history("doc-1", None).unwrap().len(), 3);
        let page_one: Vec<String> = f
            .service
            .task_history("doc-1", Some(1))
            .unwrap()
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(page_one, vec![second.task_id, first.task_id]);

        assert!(matches!(
            f.service.task_history("missing", None),
            Err(EnqueueError::NotFound(_))
        ));
        assert!(matches!(
            f.service.task_history("doc-1", Some(0)),
            Err(EnqueueError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_statistics() {
        let f = fixture();
        let empty = f.service.statistics("doc-1").unwrap();
        assert_eq!(empty.processed_pages, 0);
        assert_eq!(empty.average_confidence, None);
        assert!(empty.engines.is_empty());

        let done = f
            .service
            .request_processing("doc-1", 1, &OcrRequest::default())
            .unwrap();
        complete(&f.db, &done.task_id);
        let cancelled = f
            .service
            .request_processing("doc-1", 2, &OcrRequest::default())
            .unwrap();
        f.service.cancel_task(&cancelled.task_id, "stop").unwrap();
        f.service
            .request_processing("doc-1", 3, &OcrRequest::default())
            .unwrap();

        let stats = f.service.statistics("doc-1").unwrap();
        assert_eq!(stats.processed_pages, 1);
        assert_eq!(stats.average_confidence, Some(99.0));
        assert_eq!(stats.total_processing_ms, 3);
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.pending_tasks, 1);
        assert_eq!(stats.processing_tasks, 0);
        assert_eq!(stats.engines.get("test"), Some(&1));
        assert_eq!(stats.languages.get("zh"), Some(&1));
        assert_eq!(stats.daily.len(), 1);

        assert!(matches!(
            f.service.statistics("missing"),
            Err(EnqueueError::NotFound(_))
        ));
    }
}
