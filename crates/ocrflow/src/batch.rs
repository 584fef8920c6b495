//! Batch OCR: many documents and pages requested in one call.
//!
//! A batch is a grouping record. Each page still becomes an ordinary task
//! through the single-page request path, so the per-page idempotency rules
//! hold unchanged. The batch links the tasks it created and derives its
//! status from them on read.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EnqueueError;
use crate::model::{validate_document_id, OcrRequest, PageRef, Status};

pub const BATCH_ID_PREFIX: &str = "batch_ocr_";

/// Upper bound on pages in one batch.
pub const MAX_BATCH_PAGES: usize = 1000;

/// Generates a batch id: `batch_ocr_` followed by 16 hex characters.
pub fn new_batch_id() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", BATCH_ID_PREFIX, &raw[..16])
}

/// A batch request as submitted by a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(default)]
    pub document_ids: Vec<String>,
    /// Pages per document. Documents without an entry get page 1.
    #[serde(default)]
    pub pages: BTreeMap<String, Vec<i64>>,
    /// Options applied to every page.
    #[serde(flatten)]
    pub options: OcrRequest,
}

impl BatchRequest {
    /// Validates the request and expands it into page addresses.
    ///
    /// Document order follows the request; duplicate documents and pages
    /// collapse, and pages come out ascending within a document.
    pub fn plan(&self) -> Result<Vec<PageRef>, EnqueueError> {
        if self.document_ids.is_empty() {
            return Err(EnqueueError::InvalidRequest(
                "documentIds must not be empty".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        let mut documents = Vec::new();
        for document_id in &self.document_ids {
            validate_document_id(document_id)?;
            if seen.insert(document_id.as_str()) {
                documents.push(document_id.as_str());
            }
        }

        if let Some(stray) = self.pages.keys().find(|k| !seen.contains(k.as_str())) {
            return Err(EnqueueError::InvalidRequest(format!(
                "pages lists document '{}' which is not in documentIds",
                stray
            )));
        }

        let mut plan = Vec::new();
        for document_id in documents {
            let pages: &[i64] = match self.pages.get(document_id) {
                Some(pages) if pages.is_empty() => {
                    return Err(EnqueueError::InvalidRequest(format!(
                        "pages for document '{}' must not be empty",
                        document_id
                    )));
                }
                Some(pages) => pages.as_slice(),
                None => &[1],
            };
            let mut numbers = BTreeSet::new();
            for &page in pages {
                numbers.insert(PageRef::new(document_id, page)?.page_number);
            }
            plan.extend(numbers.into_iter().map(|page_number| PageRef {
                document_id: document_id.to_string(),
                page_number,
            }));
        }

        if plan.len() > MAX_BATCH_PAGES {
            return Err(EnqueueError::InvalidRequest(format!(
                "batch of {} pages exceeds the limit of {}",
                plan.len(),
                MAX_BATCH_PAGES
            )));
        }
        Ok(plan)
    }
}

/// Outcome of one page of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub document_id: String,
    pub page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Acknowledgement of an accepted batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReceipt {
    pub batch_id: String,
    pub total_documents: u32,
    pub total_pages: u32,
    /// Pages that got a new task.
    pub queued: u32,
    /// Pages already processed or in flight, or otherwise refused.
    pub skipped: u32,
    /// Seconds.
    pub estimated_time: u32,
    pub items: Vec<BatchItem>,
}

/// Stored batch row.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
    pub batch_id: String,
    pub total_documents: u32,
    pub total_pages: u32,
    pub estimated_seconds: u32,
    pub created_at: DateTime<Utc>,
}

/// Aggregate state of a batch, derived from its tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub batch_id: String,
    pub status: Status,
    pub progress: u8,
    pub total_documents: u32,
    pub total_pages: u32,
    pub total_tasks: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_confidence: Option<f64>,
    /// Seconds.
    pub estimated_remaining: u64,
    pub created_at: DateTime<Utc>,
}

impl BatchStatus {
    /// Folds per-status task counts into the batch view.
    ///
    /// Any unresolved task keeps the batch open. A resolved batch is
    /// `failed` only when no task completed.
    pub fn from_counts(
        record: &BatchRecord,
        counts: &[(Status, u64)],
        average_confidence: Option<f64>,
    ) -> Self {
        let count = |status: Status| {
            counts
                .iter()
                .filter(|(s, _)| *s == status)
                .map(|(_, n)| *n)
                .sum::<u64>()
        };
        let pending = count(Status::Pending);
        let processing = count(Status::Processing);
        let completed = count(Status::Completed);
        let failed = count(Status::Failed);
        let total_tasks = pending + processing + completed + failed;
        let resolved = completed + failed;

        let status = if pending + processing > 0 {
            if processing > 0 || resolved > 0 {
                Status::Processing
            } else {
                Status::Pending
            }
        } else if total_tasks > 0 && completed == 0 {
            Status::Failed
        } else {
            Status::Completed
        };
        let progress = if total_tasks == 0 {
            100
        } else {
            (resolved * 100 / total_tasks) as u8
        };

        Self {
            batch_id: record.batch_id.clone(),
            status,
            progress,
            total_documents: record.total_documents,
            total_pages: record.total_pages,
            total_tasks,
            pending,
            processing,
            completed,
            failed,
            average_confidence,
            estimated_remaining: (pending + processing) * u64::from(record.estimated_seconds),
            created_at: record.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: &str) -> BatchRequest {
        serde_json::from_str(json).unwrap()
    }

    fn record() -> BatchRecord {
        BatchRecord {
            batch_id: "batch_ocr_test".to_string(),
            total_documents: 2,
            total_pages: 4,
            estimated_seconds: 15,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_batch_id_format() {
        let id = new_batch_id();
        assert!(id.starts_with(BATCH_ID_PREFIX));
        assert_eq!(id.len(), BATCH_ID_PREFIX.len() + 16);
        assert_ne!(id, new_batch_id());
    }

    #[test]
    fn test_plan_defaults_to_first_page() {
        let plan = request(r#"{"documentIds":["a","b","a"],"pages":{"b":[3,2,3]}}"#)
            .plan()
            .unwrap();
        let pages: Vec<_> = plan
            .iter()
            .map(|p| (p.document_id.as_str(), p.page_number))
            .collect();
        assert_eq!(pages, vec![("a", 1), ("b", 2), ("b", 3)]);
    }

    #[test]
    fn test_plan_carries_options() {
        let batch = request(r#"{"documentIds":["a"],"language":"en","priority":4}"#);
        assert_eq!(batch.options.language.as_deref(), Some("en"));
        assert_eq!(batch.options.priority, Some(4));
    }

    #[test]
    fn test_plan_rejects_bad_input() {
        for json in [
            r#"{"documentIds":[]}"#,
            r#"{}"#,
            r#"{"documentIds":[""]}"#,
            r#"{"documentIds":["a"],"pages":{"b":[1]}}"#,
            r#"{"documentIds":["a"],"pages":{"a":[]}}"#,
            r#"{"documentIds":["a"],"pages":{"a":[0]}}"#,
        ] {
            assert!(
                matches!(request(json).plan(), Err(EnqueueError::InvalidRequest(_))),
                "{}",
                json
            );
        }

        let pages: Vec<i64> = (1..=(MAX_BATCH_PAGES as i64 + 1)).collect();
        let mut batch = BatchRequest {
            document_ids: vec!["a".to_string()],
            ..Default::default()
        };
        batch.pages.insert("a".to_string(), pages);
        assert!(matches!(batch.plan(), Err(EnqueueError::InvalidRequest(_))));
    }

    #[test]
    fn test_status_while_running() {
        let status = BatchStatus::from_counts(
            &record(),
            &[(Status::Pending, 1), (Status::Processing, 1), (Status::Completed, 2)],
            Some(90.0),
        );
        assert_eq!(status.status, Status::Processing);
        assert_eq!(status.total_tasks, 4);
        assert_eq!(status.progress, 50);
        assert_eq!(status.estimated_remaining, 30);
        assert_eq!(status.average_confidence, Some(90.0));

        let waiting = BatchStatus::from_counts(&record(), &[(Status::Pending, 3)], None);
        assert_eq!(waiting.status, Status::Pending);
        assert_eq!(waiting.progress, 0);
    }

    #[test]
    fn test_status_once_resolved() {
        let mixed = BatchStatus::from_counts(
            &record(),
            &[(Status::Completed, 1), (Status::Failed, 3)],
            Some(80.0),
        );
        assert_eq!(mixed.status, Status::Completed);
        assert_eq!(mixed.progress, 100);
        assert_eq!(mixed.estimated_remaining, 0);

        let failed = BatchStatus::from_counts(&record(), &[(Status::Failed, 2)], None);
        assert_eq!(failed.status, Status::Failed);

        let empty = BatchStatus::from_counts(&record(), &[], None);
        assert_eq!(empty.status, Status::Completed);
        assert_eq!(empty.progress, 100);
    }
}
