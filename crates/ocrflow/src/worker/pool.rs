use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, SendTimeoutError, Sender, TrySendError};
use log::{debug, error, info};

use super::executor::Worker;
use super::job::{JobOutcome, OcrJob};
use crate::error::WorkerError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cloneable submission side of a [`WorkerPool`].
#[derive(Clone)]
pub struct Dispatcher {
    sender: Sender<OcrJob>,
    shutdown: Arc<AtomicBool>,
    worker: Arc<Worker>,
}

impl Dispatcher {
    /// Hands a job to the pool, blocking while every slot is taken.
    pub fn submit(&self, job: OcrJob) -> Result<(), WorkerError> {
        let mut job = job;
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(WorkerError::ChannelClosed);
            }
            match self.sender.send_timeout(job, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => job = returned,
                Err(SendTimeoutError::Disconnected(_)) => return Err(WorkerError::ChannelClosed),
            }
        }
    }

    /// Hands a job to the pool without waiting.
    pub fn try_submit(&self, job: OcrJob) -> Result<(), WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::ChannelClosed);
        }
        self.sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => WorkerError::Saturated,
            TrySendError::Disconnected(_) => WorkerError::ChannelClosed,
        })
    }

    /// Fails a job that could not be handed over.
    pub fn abandon(&self, job: &OcrJob, reason: &str) {
        self.worker.abandon(job, reason);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// Fixed set of OS threads, each driving its own current-thread runtime,
/// fed through a bounded channel.
pub struct WorkerPool {
    dispatcher: Dispatcher,
    job_receiver: Receiver<OcrJob>,
    result_receiver: Receiver<JobOutcome>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts `worker_count` threads sharing a queue of `capacity` jobs.
    pub fn new(worker: Arc<Worker>, worker_count: usize, capacity: usize) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker_count must be > 0".to_string(),
            ));
        }
        let (job_sender, job_receiver) = bounded::<OcrJob>(capacity.max(1));
        let (result_sender, result_receiver) = unbounded::<JobOutcome>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let job_rx = job_receiver.clone();
            let result_tx = result_sender.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let worker = Arc::clone(&worker);

            let handle = thread::Builder::new()
                .name(format!("ocr-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, job_rx, result_tx, shutdown_flag, worker))
                .map_err(|e| {
                    shutdown.store(true, Ordering::Relaxed);
                    WorkerError::SpawnFailed(e.to_string())
                })?;

            workers.push(handle);
        }

        info!(
            "Started {} workers (queue capacity {})",
            worker_count,
            capacity.max(1)
        );

        Ok(Self {
            dispatcher: Dispatcher {
                sender: job_sender,
                shutdown: Arc::clone(&shutdown),
                worker,
            },
            job_receiver,
            result_receiver,
            workers,
            shutdown,
        })
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn submit(&self, job: OcrJob) -> Result<(), WorkerError> {
        self.dispatcher.submit(job)
    }

    pub fn try_submit(&self, job: OcrJob) -> Result<(), WorkerError> {
        self.dispatcher.try_submit(job)
    }

    pub fn try_recv_result(&self) -> Option<JobOutcome> {
        self.result_receiver.try_recv().ok()
    }

    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<JobOutcome> {
        self.result_receiver.recv_timeout(timeout).ok()
    }

    /// Receiver of job outcomes, for a consumer on another thread.
    pub fn results(&self) -> Receiver<JobOutcome> {
        self.result_receiver.clone()
    }

    /// Stops accepting jobs and interrupts the ones in flight.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down worker pool...");
        let interrupted = self.dispatcher.worker.registry().close("worker pool shutting down");
        if interrupted > 0 {
            info!("Interrupted {} in-flight OCR task(s)", interrupted);
        }
    }

    /// Joins every worker and fails the jobs that were queued but never
    /// started. Returns those jobs.
    pub fn wait(self) -> Vec<OcrJob> {
        self.shutdown();

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        let abandoned: Vec<OcrJob> = self.job_receiver.try_iter().collect();
        for job in &abandoned {
            self.dispatcher.abandon(job, "worker pool stopped before the job started");
        }

        info!("All workers have stopped");
        abandoned
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

fn run_worker(
    worker_id: usize,
    job_receiver: Receiver<OcrJob>,
    result_sender: Sender<JobOutcome>,
    shutdown: Arc<AtomicBool>,
    worker: Arc<Worker>,
) {
    debug!("Worker {} started", worker_id);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Worker {} failed to build runtime: {}", worker_id, e);
            return;
        }
    };

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match job_receiver.recv_timeout(POLL_INTERVAL) {
            Ok(job) => {
                debug!(
                    "Worker {} processing queue entry {} ({})",
                    worker_id, job.queue_id, job.document_id
                );

                let outcome = runtime.block_on(worker.run_job(&job));

                if let Err(e) = result_sender.send(outcome) {
                    debug!("Worker {} result dropped: {}", worker_id, e);
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                debug!("Worker {} job channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
