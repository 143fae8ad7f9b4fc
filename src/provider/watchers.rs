//! Per-microtask timeout watchers.
//!
//! A watcher is a spawned sleep that reports the expired task back to the
//! coordinating loop. It never touches the job collection itself.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::provider::slots::TaskRef;

/// Timer handles keyed by microtask id.
#[derive(Debug, Default)]
pub struct Watchers {
    handles: HashMap<String, JoinHandle<()>>,
}

impl Watchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a watcher for `task`, replacing any existing one for the same id.
    pub fn arm(&mut self, task: TaskRef, timeout: Duration, fired: mpsc::UnboundedSender<TaskRef>) {
        let key = task.task_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = fired.send(task);
        });
        if let Some(previous) = self.handles.insert(key, handle) {
            previous.abort();
        }
    }

    /// Cancel the watcher for `task_id`. Returns whether one was armed.
    pub fn cancel(&mut self, task_id: &str) -> bool {
        match self.handles.remove(task_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget a watcher that has already fired.
    pub fn forget(&mut self, task_id: &str) {
        self.handles.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn clear_all(&mut self) {
        let count = self.handles.len();
        for (_, handle) in self.handles.drain() {
            handle.abort();
        }
        debug!(count, "Cleared timeout watchers");
    }
}

impl Drop for Watchers {
    fn drop(&mut self) {
        for handle in self.handles.values() {
            handle.abort();
        }
    }
}
