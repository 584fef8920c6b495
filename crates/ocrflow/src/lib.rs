pub mod batch;
pub mod config;
pub mod db;
pub mod document;
pub mod engine;
pub mod enqueue;
pub mod error;
pub mod identity;
pub mod model;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod tasks;
pub mod worker;

pub use batch::{BatchReceipt, BatchRequest, BatchStatus};
pub use config::{load_config, Config, OcrDefaults};
pub use db::{Database, DatabaseError};
pub use document::{DocumentStore, PageSource, SqliteDocumentStore};
pub use engine::{default_engine, JobContext, MarkupEngine, OcrEngine};
pub use enqueue::{EnqueueReceipt, EnqueueService};
pub use error::{
    ConfigError, DocumentError, EngineError, EnqueueError, OcrflowError, Result, TaskError,
    WorkerError,
};
pub use identity::{AuthError, IdentityProvider, StaticTokenIdentity, UserId};
pub use model::{
    DocumentOcrStats, OcrOptions, OcrRequest, OcrResult, OcrTask, QueueEntry, Recognition, Status,
};
pub use queue::ProcessingQueue;
pub use runtime::{HealthReport, Pipeline};
pub use scheduler::{DrainReport, Scheduler};
pub use tasks::TaskStore;
pub use worker::{JobOutcome, OcrJob, Worker, WorkerPool};
