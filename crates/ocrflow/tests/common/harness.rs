//! Test harness for isolated pipeline execution.
//!
//! The `TestHarness` owns a temporary directory holding a file-backed
//! database, and hands out the queue, task store, enqueue service and
//! workers wired to it.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use ocrflow::config::{OcrDefaults, SchedulerConfig};
use ocrflow::db::Database;
use ocrflow::document::SqliteDocumentStore;
use ocrflow::engine::OcrEngine;
use ocrflow::enqueue::EnqueueService;
use ocrflow::model::{OcrTask, Status};
use ocrflow::queue::ProcessingQueue;
use ocrflow::scheduler::Scheduler;
use ocrflow::tasks::TaskStore;
use ocrflow::worker::{CancelRegistry, Worker, WorkerPool};

/// Test harness providing an isolated database for integration tests.
pub struct TestHarness {
    temp_dir: TempDir,
    pub db: Database,
    pub documents: Arc<SqliteDocumentStore>,
    pub registry: Arc<CancelRegistry>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open(&temp_dir.path().join("ocrflow.db"))
            .expect("Failed to open test database");
        Self {
            documents: Arc::new(SqliteDocumentStore::new(db.clone())),
            registry: Arc::new(CancelRegistry::new()),
            db,
            temp_dir,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Seeds a document whose pages are plain text.
    pub fn seed_document(&self, document_id: &str, pages: &[&str]) {
        self.documents
            .insert_document(document_id, document_id, None, pages.len() as u32)
            .expect("Failed to seed document");
        for (i, text) in pages.iter().enumerate() {
            self.documents
                .insert_page_source(document_id, i as u32 + 1, "text/plain", text.as_bytes())
                .expect("Failed to seed page");
        }
    }

    pub fn queue(&self) -> ProcessingQueue {
        ProcessingQueue::new(self.db.clone())
    }

    pub fn tasks(&self) -> TaskStore {
        TaskStore::new(self.db.clone())
    }

    pub fn enqueue(&self) -> EnqueueService {
        EnqueueService::new(
            self.db.clone(),
            self.documents.clone(),
            self.registry.clone(),
            OcrDefaults::default(),
        )
    }

    pub fn worker(&self, engine: Arc<dyn OcrEngine>, timeout: Duration) -> Arc<Worker> {
        Arc::new(Worker::new(
            self.db.clone(),
            self.documents.clone(),
            engine,
            self.registry.clone(),
            timeout,
        ))
    }

    /// A pool of `workers` threads and a scheduler draining into it.
    pub fn pipeline(
        &self,
        engine: Arc<dyn OcrEngine>,
        timeout: Duration,
        workers: usize,
        batch_size: u32,
    ) -> (WorkerPool, Scheduler) {
        let pool = WorkerPool::new(self.worker(engine, timeout), workers, 64)
            .expect("Failed to start worker pool");
        let scheduler = Scheduler::new(
            self.queue(),
            pool.dispatcher(),
            &SchedulerConfig {
                interval_secs: 30,
                batch_size,
            },
        );
        (pool, scheduler)
    }

    /// Polls until the task is terminal.
    pub fn wait_terminal(&self, task_id: &str, timeout: Duration) -> OcrTask {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let task = self
                .tasks()
                .get(task_id)
                .expect("Failed to load task")
                .expect("Task missing");
            if task.status.is_terminal() || std::time::Instant::now() >= deadline {
                return task;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn entry_status(&self, queue_id: i64) -> Status {
        self.queue()
            .get(queue_id)
            .expect("Failed to load queue entry")
            .expect("Queue entry missing")
            .status
    }
}
