//! In-process locking: the per-task claim lock used by the worker pool
//! and the single landing lock serializing merges to main.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

/// Tracks which task ids currently have an attempt in flight, so a
/// worker scanning the ready set never starts a second concurrent
/// attempt for the same task. One entry per claimed id, created
/// lazily; a worker that loses the race for a given id moves on to the
/// next candidate rather than waiting.
pub struct TaskLock {
    held: Arc<Mutex<BTreeSet<String>>>,
}

impl TaskLock {
    pub fn new() -> Arc<Self> {
        Arc::new(TaskLock { held: Arc::new(Mutex::new(BTreeSet::new())) })
    }

    /// Attempt to claim `task_id`. Returns `None` if another worker
    /// already holds it. The returned guard releases the claim on
    /// drop, regardless of how the caller's attempt ends.
    pub async fn claim(self: &Arc<Self>, task_id: &str) -> Option<TaskClaim> {
        let mut held = self.held.lock().await;
        if held.contains(task_id) {
            return None;
        }
        held.insert(task_id.to_string());
        drop(held);
        Some(TaskClaim {
            held: self.held.clone(),
            task_id: task_id.to_string(),
        })
    }

    #[cfg(test)]
    async fn is_held(&self, task_id: &str) -> bool {
        self.held.lock().await.contains(task_id)
    }
}

/// Holds a task's claim for the lifetime of one lifecycle attempt.
pub struct TaskClaim {
    held: Arc<Mutex<BTreeSet<String>>>,
    task_id: String,
}

impl Drop for TaskClaim {
    fn drop(&mut self) {
        let held = self.held.clone();
        let task_id = std::mem::take(&mut self.task_id);
        tokio::spawn(async move {
            held.lock().await.remove(&task_id);
        });
    }
}

/// A single process-wide mutex serializing landing attempts. FIFO
/// arrival order falls out of `tokio::sync::Mutex`'s fair queueing.
///
/// Held from just before auto-commit through the terminal landing
/// decision for one task (acquire before auto-commit, release only
/// after the terminal decision).
pub struct LandingLock {
    inner: Mutex<()>,
}

impl LandingLock {
    pub fn new() -> Arc<Self> {
        Arc::new(LandingLock { inner: Mutex::new(()) })
    }

    /// Acquire the landing lock, blocking until any in-flight merge
    /// completes. The returned guard releases on drop.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}
