//! Periodic drain of the processing queue.
//!
//! One timer, one lease per tick, one dispatch per leased entry. A manual
//! trigger runs a cycle immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::SchedulerConfig;
use crate::model::validate_document_id;
use crate::queue::ProcessingQueue;
use crate::worker::{Dispatcher, OcrJob};

/// Summary of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub leased: usize,
    pub dispatched: usize,
    pub failed: usize,
    /// The lease itself failed; nothing was touched.
    pub skipped: bool,
}

/// Periodic queue drainer.
#[derive(Clone)]
pub struct Scheduler {
    queue: ProcessingQueue,
    dispatcher: Dispatcher,
    interval: Duration,
    batch_size: u32,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(queue: ProcessingQueue, dispatcher: Dispatcher, config: &SchedulerConfig) -> Self {
        Self {
            queue,
            dispatcher,
            interval: Duration::from_secs(config.interval_secs),
            batch_size: config.batch_size,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Overrides the tick period.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs one drain cycle: lease a batch and dispatch each entry.
    ///
    /// Never panics and never propagates: a failed lease skips the cycle, a
    /// failed entry is marked failed and the rest of the batch continues.
    pub fn drain_once(&self) -> DrainReport {
        let _span = tracing::info_span!("scheduler.drain").entered();
        let mut report = DrainReport::default();

        let entries = match self.queue.lease_batch(self.batch_size) {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("Failed to lease queue entries, skipping cycle: {}", e);
                report.skipped = true;
                return report;
            }
        };
        report.leased = entries.len();
        if entries.is_empty() {
            log::debug!("Drain cycle: queue empty");
            return report;
        }
        log::info!("Drain cycle: leased {} entr(ies)", entries.len());

        for entry in &entries {
            let job = OcrJob::from_entry(entry);

            if let Err(e) = validate_document_id(&entry.document_id) {
                log::error!(
                    "Queue entry {} has invalid document id {:?}: {}",
                    entry.queue_id,
                    entry.document_id,
                    e
                );
                self.dispatcher.abandon(&job, &e.to_string());
                report.failed += 1;
                continue;
            }

            match self.dispatcher.submit(job.clone()) {
                Ok(()) => report.dispatched += 1,
                Err(e) => {
                    log::error!(
                        "Failed to dispatch queue entry {} (document {}): {}",
                        entry.queue_id,
                        entry.document_id,
                        e
                    );
                    self.dispatcher.abandon(&job, &e.to_string());
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Start the drain loop in a background thread.
    /// Accepts a trigger receiver for manual drain requests.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let scheduler = self.clone();

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Scheduler failed to build runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(scheduler.interval);
                interval_timer.tick().await; // skip immediate first tick

                loop {
                    if scheduler.shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::info!("Manual drain triggered");
                        },
                    }

                    if scheduler.shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    let report = scheduler.drain_once();
                    if report.failed > 0 {
                        log::warn!(
                            "Drain cycle: {} dispatched, {} failed",
                            report.dispatched,
                            report.failed
                        );
                    }
                }
            });

            log::info!("Scheduler stopped");
        })
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::document::{PageSource, SqliteDocumentStore};
    use crate::engine::{JobContext, OcrEngine};
    use crate::error::EngineError;
    use crate::model::{OcrOptions, Recognition, Status};
    use crate::worker::{CancelRegistry, Worker, WorkerPool};
    use async_trait::async_trait;

    struct NullEngine;

    #[async_trait]
    impl OcrEngine for NullEngine {
        fn name(&self) -> &str {
            "null"
        }
        fn supported_languages(&self) -> Vec<String> {
            vec![]
        }
        async fn recognize(
            &self,
            _page: &PageSource,
            _options: &OcrOptions,
            _ctx: &JobContext,
        ) -> Result<Recognition, EngineError> {
            Err(EngineError::Failed("null engine".to_string()))
        }
    }

    fn pool(db: &Database) -> WorkerPool {
        let worker = Arc::new(Worker::new(
            db.clone(),
            Arc::new(SqliteDocumentStore::new(db.clone())),
            Arc::new(NullEngine),
            Arc::new(CancelRegistry::new()),
            Duration::from_secs(5),
        ));
        WorkerPool::new(worker, 1, 32).unwrap()
    }

    fn config(batch_size: u32) -> SchedulerConfig {
        SchedulerConfig {
            interval_secs: 30,
            batch_size,
        }
    }

    #[test]
    fn test_drain_empty_queue() {
        let db = Database::open_in_memory().unwrap();
        let pool = pool(&db);
        let scheduler = Scheduler::new(ProcessingQueue::new(db.clone()), pool.dispatcher(), &config(10));
        assert_eq!(scheduler.drain_once(), DrainReport::default());
        pool.wait();
    }

    #[test]
    fn test_drain_respects_batch_size() {
        let db = Database::open_in_memory().unwrap();
        let queue = ProcessingQueue::new(db.clone());
        for i in 0..15 {
            queue.enqueue(&format!("doc-{}", i), 1).unwrap();
        }
        let pool = pool(&db);
        let scheduler = Scheduler::new(queue.clone(), pool.dispatcher(), &config(10));

        let first = scheduler.drain_once();
        assert_eq!(first.leased, 10);
        assert_eq!(first.dispatched, 10);
        let second = scheduler.drain_once();
        assert_eq!(second.leased, 5);
        assert_eq!(scheduler.drain_once().leased, 0);
        pool.wait();
    }

    #[test]
    fn test_invalid_entry_is_isolated() {
        let db = Database::open_in_memory().unwrap();
        let queue = ProcessingQueue::new(db.clone());
        let bad = queue.enqueue("bad\u{0007}id", 5).unwrap();
        queue.enqueue("good", 1).unwrap();
        let pool = pool(&db);
        let scheduler = Scheduler::new(queue.clone(), pool.dispatcher(), &config(10));

        let report = scheduler.drain_once();
        assert_eq!(report.leased, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(queue.get(bad).unwrap().unwrap().status, Status::Failed);
        pool.wait();
    }

    #[test]
    fn test_dispatch_failure_marks_entry_failed() {
        let db = Database::open_in_memory().unwrap();
        let queue = ProcessingQueue::new(db.clone());
        let id = queue.enqueue("doc", 1).unwrap();
        let pool = pool(&db);
        let scheduler = Scheduler::new(queue.clone(), pool.dispatcher(), &config(10));
        pool.shutdown();

        let report = scheduler.drain_once();
        assert_eq!(report.failed, 1);
        let entry = queue.get(id).unwrap().unwrap();
        assert_eq!(entry.status, Status::Failed);
        assert!(entry.error_message.is_some());
        pool.wait();
    }

    #[test]
    fn test_failed_lease_skips_cycle_and_next_tick_recovers() {
        let db = Database::open_in_memory().unwrap();
        let queue = ProcessingQueue::new(db.clone());
        let id = queue.enqueue("doc", 1).unwrap();
        let pool = pool(&db);
        let scheduler = Scheduler::new(queue.clone(), pool.dispatcher(), &config(10));

        db.with_conn(|conn| {
            conn.execute_batch("ALTER TABLE processing_queue RENAME TO processing_queue_offline;")?;
            Ok(())
        })
        .unwrap();
        let report = scheduler.drain_once();
        assert!(report.skipped);
        assert_eq!(report.leased, 0);
        assert_eq!(report.dispatched, 0);

        db.with_conn(|conn| {
            conn.execute_batch("ALTER TABLE processing_queue_offline RENAME TO processing_queue;")?;
            Ok(())
        })
        .unwrap();
        // The failed cycle touched nothing.
        assert_eq!(queue.get(id).unwrap().unwrap().status, Status::Pending);

        let report = scheduler.drain_once();
        assert!(!report.skipped);
        assert_eq!(report.leased, 1);
        assert_eq!(report.dispatched, 1);
        pool.wait();
    }

    #[test]
    fn test_scheduler_shutdown() {
        let db = Database::open_in_memory().unwrap();
        let pool = pool(&db);
        let scheduler = Scheduler::new(ProcessingQueue::new(db.clone()), pool.dispatcher(), &config(10))
            .with_interval(Duration::from_millis(50));

        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let handle = scheduler.start(trigger_rx);

        // Let it run briefly then stop
        std::thread::sleep(Duration::from_millis(100));
        scheduler.stop();

        // Send a trigger to wake up the select loop so it sees the shutdown
        let _ = trigger_tx.send(());

        handle.join().expect("scheduler thread panicked");
        pool.wait();
    }

    #[test]
    fn test_manual_trigger_drains() {
        let db = Database::open_in_memory().unwrap();
        let queue = ProcessingQueue::new(db.clone());
        let pool = pool(&db);
        let scheduler = Scheduler::new(queue.clone(), pool.dispatcher(), &config(10))
            .with_interval(Duration::from_secs(3600));

        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let handle = scheduler.start(trigger_rx);
        queue.enqueue("doc", 1).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        trigger_tx.send(()).unwrap();

        let outcome = pool.recv_result_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.document_id, "doc");

        scheduler.stop();
        let _ = trigger_tx.send(());
        handle.join().unwrap();
        pool.wait();
    }
}
