use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum OcrflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Enqueue error: {0}")]
    Enqueue(#[from] EnqueueError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("OCR engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Failures of a processing request, in the order the checks run.
#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Page {page} of document '{document_id}' has already been processed")]
    AlreadyProcessed { document_id: String, page: u32 },

    #[error("Page {page} of document '{document_id}' is already queued or processing")]
    InProgress { document_id: String, page: u32 },

    #[error("Storage unavailable: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Document store unavailable: {0}")]
    Documents(#[source] DocumentError),
}

impl EnqueueError {
    /// Whether the failure comes from infrastructure rather than the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Documents(_))
    }
}

impl From<TaskError> for EnqueueError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Duplicate {
                document_id,
                page,
                completed: true,
            } => Self::AlreadyProcessed { document_id, page },
            TaskError::Duplicate {
                document_id,
                page,
                completed: false,
            } => Self::InProgress { document_id, page },
            TaskError::NotFound(id) => Self::NotFound(format!("OCR task '{}'", id)),
            TaskError::Database(e) => Self::Storage(e),
        }
    }
}

impl From<DocumentError> for EnqueueError {
    fn from(err: DocumentError) -> Self {
        match err {
            DocumentError::NotFound(id) => Self::NotFound(format!("document '{}'", id)),
            other => Self::Documents(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error(
        "A {} task already exists for page {page} of document '{document_id}'",
        duplicate_kind(.completed)
    )]
    Duplicate {
        document_id: String,
        page: u32,
        completed: bool,
    },

    #[error("OCR task not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

fn duplicate_kind(completed: &bool) -> &'static str {
    if *completed {
        "completed"
    } else {
        "pending or processing"
    }
}

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Page {page} of document '{document_id}' has no content to recognize")]
    PageUnavailable { document_id: String, page: u32 },

    #[error("Failed to read document file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("OCR failed: {0}")]
    Failed(String),

    #[error("OCR timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),

    #[error("OCR cancelled: {0}")]
    Cancelled(String),

    #[error("Unsupported content: {0}")]
    Unsupported(String),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Worker pool is saturated")]
    Saturated,
}

pub type Result<T> = std::result::Result<T, OcrflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_task_maps_to_idempotency_errors() {
        let completed: EnqueueError = TaskError::Duplicate {
            document_id: "doc-1".to_string(),
            page: 2,
            completed: true,
        }
        .into();
        assert!(matches!(
            completed,
            EnqueueError::AlreadyProcessed { page: 2, .. }
        ));

        let in_flight: EnqueueError = TaskError::Duplicate {
            document_id: "doc-1".to_string(),
            page: 2,
            completed: false,
        }
        .into();
        assert!(matches!(in_flight, EnqueueError::InProgress { page: 2, .. }));
    }

    #[test]
    fn test_transient_classification() {
        assert!(EnqueueError::Storage(DatabaseError::LockPoisoned).is_transient());
        assert!(!EnqueueError::InvalidRequest("bad".to_string()).is_transient());
        assert!(!EnqueueError::NotFound("doc".to_string()).is_transient());
    }

    #[test]
    fn test_timeout_message() {
        let err = EngineError::TimedOut(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "OCR timed out after 1.5s");
    }

    #[test]
    fn test_duplicate_message() {
        let err = TaskError::Duplicate {
            document_id: "d".to_string(),
            page: 1,
            completed: false,
        };
        assert!(err.to_string().contains("pending or processing"));
    }
}
