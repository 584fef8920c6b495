//! Wires storage, workers and the scheduler into a running pipeline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::db::Database;
use crate::document::DocumentStore;
use crate::engine::OcrEngine;
use crate::enqueue::EnqueueService;
use crate::error::{OcrflowError, WorkerError};
use crate::model::Status;
use crate::queue::ProcessingQueue;
use crate::scheduler::Scheduler;
use crate::tasks::TaskStore;
use crate::worker::{CancelRegistry, JobOutcome, Worker, WorkerPool};

const RESULT_POLL: Duration = Duration::from_millis(100);

/// Counters of resolved jobs since start.
#[derive(Default)]
struct OutcomeCounters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of the pipeline, served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub running: bool,
    pub workers: usize,
    pub pending_entries: u64,
    pub processing_entries: u64,
    pub pending_tasks: u64,
    pub processing_tasks: u64,
    pub in_flight: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

/// A running OCR pipeline.
///
/// Owns the worker pool, the scheduler thread and the thread that consumes
/// job outcomes. Dropping it without calling [`Pipeline::shutdown`] leaves
/// those threads running.
pub struct Pipeline {
    enqueue: EnqueueService,
    queue: ProcessingQueue,
    tasks: TaskStore,
    registry: Arc<CancelRegistry>,
    scheduler: Scheduler,
    trigger_tx: broadcast::Sender<()>,
    pool: Mutex<Option<WorkerPool>>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    consumer_handle: Mutex<Option<JoinHandle<()>>>,
    consumer_shutdown: Arc<AtomicBool>,
    counters: Arc<OutcomeCounters>,
    workers: usize,
}

impl Pipeline {
    /// Recovers work interrupted by a previous run, then starts the workers
    /// and the drain loop.
    pub fn start(
        config: &Config,
        db: Database,
        engine: Arc<dyn OcrEngine>,
        documents: Arc<dyn DocumentStore>,
    ) -> Result<Self, OcrflowError> {
        let registry = Arc::new(CancelRegistry::new());
        let worker = Arc::new(Worker::new(
            db.clone(),
            Arc::clone(&documents),
            engine,
            Arc::clone(&registry),
            Duration::from_secs(config.worker.job_timeout_secs),
        ));

        let recovered = worker.recover_interrupted()?;
        if recovered > 0 {
            log::info!("Failed {} queue entr(ies) left over from a previous run", recovered);
        }

        let pool = WorkerPool::new(
            Arc::clone(&worker),
            config.worker.count,
            config.worker.capacity(),
        )?;

        let queue = ProcessingQueue::new(db.clone());
        let scheduler = Scheduler::new(queue.clone(), pool.dispatcher(), &config.scheduler);
        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let scheduler_handle = scheduler.start(trigger_rx);

        let counters = Arc::new(OutcomeCounters::default());
        let consumer_shutdown = Arc::new(AtomicBool::new(false));
        let consumer_handle = spawn_outcome_consumer(
            pool.results(),
            Arc::clone(&consumer_shutdown),
            Arc::clone(&counters),
        )?;

        log::info!(
            "OCR pipeline started: {} worker(s), drain every {}s, batch {}",
            config.worker.count,
            config.scheduler.interval_secs,
            config.scheduler.batch_size
        );

        Ok(Self {
            enqueue: EnqueueService::new(
                db.clone(),
                documents,
                Arc::clone(&registry),
                config.ocr.clone(),
            ),
            queue,
            tasks: TaskStore::new(db),
            registry,
            scheduler,
            trigger_tx,
            pool: Mutex::new(Some(pool)),
            scheduler_handle: Mutex::new(Some(scheduler_handle)),
            consumer_handle: Mutex::new(Some(consumer_handle)),
            consumer_shutdown,
            counters,
            workers: config.worker.count,
        })
    }

    pub fn enqueue(&self) -> &EnqueueService {
        &self.enqueue
    }

    /// Runs a drain cycle now instead of waiting for the next tick.
    pub fn trigger(&self) {
        if self.trigger_tx.send(()).is_err() {
            log::debug!("Drain trigger dropped: scheduler not listening");
        }
    }

    pub fn is_running(&self) -> bool {
        self.pool.lock().map(|pool| pool.is_some()).unwrap_or(false)
    }

    pub fn health(&self) -> Result<HealthReport, OcrflowError> {
        Ok(HealthReport {
            running: self.is_running(),
            workers: self.workers,
            pending_entries: self.queue.count_by_status(Status::Pending)?,
            processing_entries: self.queue.count_by_status(Status::Processing)?,
            pending_tasks: self.tasks.count_by_status(Status::Pending)?,
            processing_tasks: self.tasks.count_by_status(Status::Processing)?,
            in_flight: self.registry.in_flight(),
            jobs_completed: self.counters.completed.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
        })
    }

    /// Stops the scheduler, interrupts running jobs and joins every thread.
    ///
    /// Jobs still waiting for a worker are failed. Safe to call twice.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        // Close the pool before joining the scheduler: a drain blocked on a
        // full pool returns once the pool is closed, and the rest of its
        // batch is failed instead of run.
        if let Ok(pool) = self.pool.lock() {
            if let Some(ref pool) = *pool {
                pool.shutdown();
            }
        }
        // wake the drain loop so it sees the flag
        let _ = self.trigger_tx.send(());
        if let Some(handle) = take(&self.scheduler_handle) {
            if handle.join().is_err() {
                log::error!("Scheduler thread panicked");
            }
        }

        if let Some(pool) = take(&self.pool) {
            let abandoned = pool.wait();
            if !abandoned.is_empty() {
                log::warn!("Failed {} job(s) that never started", abandoned.len());
            }
        }

        self.consumer_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = take(&self.consumer_handle) {
            if handle.join().is_err() {
                log::error!("Outcome consumer thread panicked");
            }
        }

        log::info!("OCR pipeline stopped");
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

fn spawn_outcome_consumer(
    results: Receiver<JobOutcome>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<OutcomeCounters>,
) -> Result<JoinHandle<()>, WorkerError> {
    std::thread::Builder::new()
        .name("ocr-outcomes".to_string())
        .spawn(move || {
            loop {
                match results.recv_timeout(RESULT_POLL) {
                    Ok(outcome) => record_outcome(&outcome, &counters),
                    Err(RecvTimeoutError::Timeout) => {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            log::info!("Outcome consumer shutting down");
        })
        .map_err(|e| WorkerError::SpawnFailed(e.to_string()))
}

fn record_outcome(outcome: &JobOutcome, counters: &OutcomeCounters) {
    if outcome.success() {
        counters.completed.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Job {} completed: {} page(s) of {}",
            outcome.queue_id,
            outcome.succeeded_pages.len(),
            outcome.document_id
        );
    } else {
        counters.failed.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "Job {} failed for {}: {} page(s) ok, {} failed ({})",
            outcome.queue_id,
            outcome.document_id,
            outcome.succeeded_pages.len(),
            outcome.failed_pages.len(),
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
}
