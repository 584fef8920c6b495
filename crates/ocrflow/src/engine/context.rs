use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::EngineError;

/// Cooperative cancellation signal shared between a running job and whoever
/// may want to stop it (timeout, `cancel_task`, shutdown).
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag. The first reason wins.
    pub fn cancel(&self, reason: &str) {
        if let Ok(mut guard) = self.inner.reason.lock() {
            if guard.is_none() {
                *guard = Some(reason.to_string());
            }
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().ok().and_then(|g| g.clone())
    }

    /// Resolves once the flag is raised.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent `cancel` is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Receives progress updates for a task.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, task_id: &str, percent: u8);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _task_id: &str, _percent: u8) {}
}

/// Per-call context handed to an engine: who the work is for, when it must
/// be done by, and how to tell it to stop.
#[derive(Clone)]
pub struct JobContext {
    pub task_id: String,
    pub deadline: Instant,
    pub cancel: CancelFlag,
    progress: Arc<dyn ProgressReporter>,
}

impl JobContext {
    pub fn new(
        task_id: &str,
        timeout: Duration,
        cancel: CancelFlag,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            deadline: Instant::now() + timeout,
            cancel,
            progress,
        }
    }

    /// Context with no progress sink and a fresh flag.
    pub fn detached(task_id: &str, timeout: Duration) -> Self {
        Self::new(task_id, timeout, CancelFlag::new(), Arc::new(NoopProgress))
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn report_progress(&self, percent: u8) {
        self.progress.report(&self.task_id, percent.min(100));
    }

    /// Fails fast when the job has been cancelled or is past its deadline.
    ///
    /// Engines call this between steps.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled(
                self.cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            ));
        }
        if Instant::now() >= self.deadline {
            return Err(EngineError::TimedOut(Duration::ZERO));
        }
        Ok(())
    }
}
