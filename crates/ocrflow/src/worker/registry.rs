use std::collections::HashMap;
use std::sync::Mutex;

use crate::engine::CancelFlag;

/// Cancellation flags of the tasks currently being recognized.
#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    flags: HashMap<String, CancelFlag>,
    /// Set by [`CancelRegistry::close`]; later flags start out raised.
    closed: Option<String>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and tracks a fresh flag for `task_id`.
    ///
    /// Once the registry is closed the flag comes back already raised.
    pub fn register(&self, task_id: &str) -> CancelFlag {
        let flag = CancelFlag::new();
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(ref reason) = inner.closed {
                flag.cancel(reason);
            }
            inner.flags.insert(task_id.to_string(), flag.clone());
        }
        flag
    }

    pub fn remove(&self, task_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.flags.remove(task_id);
        }
    }

    /// Raises the flag of an in-flight task. Returns `false` if it is not running.
    pub fn cancel(&self, task_id: &str, reason: &str) -> bool {
        let flag = self
            .inner
            .lock()
            .ok()
            .and_then(|inner| inner.flags.get(task_id).cloned());
        match flag {
            Some(flag) => {
                flag.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Raises every tracked flag and every flag registered from now on.
    /// Returns how many in-flight tasks were interrupted.
    pub fn close(&self, reason: &str) -> usize {
        let flags: Vec<CancelFlag> = match self.inner.lock() {
            Ok(mut inner) => {
                if inner.closed.is_none() {
                    inner.closed = Some(reason.to_string());
                }
                inner.flags.values().cloned().collect()
            }
            Err(_) => return 0,
        };
        for flag in &flags {
            flag.cancel(reason);
        }
        flags.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.closed.is_some())
            .unwrap_or(true)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().map(|inner| inner.flags.len()).unwrap_or(0)
    }
}
