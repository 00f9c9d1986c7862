//! Per-task mutual exclusion.
//!
//! Every protocol handler and every scheduler action that mutates one
//! task serializes through the lock for that id. Locks are created on
//! demand and released by guard scope on every exit path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::models::TaskId;

/// Map from task id to its mutual-exclusion primitive.
#[derive(Default)]
pub struct TaskLocks {
    locks: Mutex<HashMap<TaskId, Arc<Mutex<()>>>>,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `id`, creating it on first use.
    pub async fn acquire(&self, id: &TaskId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the primitive for a task that reached a terminal status.
    pub async fn forget(&self, id: &TaskId) {
        self.locks.lock().await.remove(id);
    }
}
