//! Cancellable delayed tasks (retry republishes, completed-record eviction).
//!
//! Each task is keyed by kind and message id. Scheduling over an existing key
//! aborts the earlier task. A task leaves the registry when its delay fires,
//! so `pending()` counts only tasks still sleeping.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Retry,
    Evict,
}

type TaskKey = (TaskKind, String);

struct Entry {
    generation: u64,
    handle: AbortHandle,
}

#[derive(Default)]
pub struct DelayedTasks {
    entries: Mutex<HashMap<TaskKey, Entry>>,
    next_generation: AtomicU64,
}

impl DelayedTasks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<TaskKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `task` after `delay` unless cancelled first.
    pub fn schedule<F>(self: &Arc<Self>, kind: TaskKind, id: &str, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = (kind, id.to_string());
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::downgrade(self);

        // held across spawn so a zero-delay task cannot deregister before it is registered
        let mut entries = self.entries();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(registry) = registry.upgrade() {
                registry.finish(&task_key, generation);
            }
            task.await;
        });

        let entry = Entry {
            generation,
            handle: handle.abort_handle(),
        };
        if let Some(previous) = entries.insert(key, entry) {
            previous.handle.abort();
        }
    }

    fn finish(&self, key: &TaskKey, generation: u64) {
        let mut entries = self.entries();
        if entries.get(key).map(|e| e.generation) == Some(generation) {
            entries.remove(key);
        }
    }

    pub fn cancel(&self, kind: TaskKind, id: &str) -> bool {
        match self.entries().remove(&(kind, id.to_string())) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every pending task; returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.handle.abort();
        }
        drained.len()
    }

    pub fn pending(&self, kind: TaskKind) -> usize {
        self.entries().keys().filter(|(k, _)| *k == kind).count()
    }

    pub fn is_pending(&self, kind: TaskKind, id: &str) -> bool {
        self.entries().contains_key(&(kind, id.to_string()))
    }
}
