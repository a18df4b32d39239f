//! In-process change source with no backing store.
//!
//! Used when `upstream.kind = "memory"` and by the gateway's tests: callers
//! push snapshots with [`MemorySource::emit`] and inspect live watchers with
//! [`MemorySource::watch_count`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

use crate::error::UpstreamError;
use crate::source::{ChangeCallback, ChangeSource, Snapshot, WatchHandle};

#[derive(Default)]
struct Watchers {
    by_path: HashMap<String, Vec<(u64, ChangeCallback)>>,
}

#[derive(Default)]
struct Inner {
    watchers: Mutex<Watchers>,
    next_id: AtomicU64,
    failures_pending: AtomicUsize,
    watches_started: AtomicUsize,
}

impl Inner {
    fn watchers(&self) -> MutexGuard<'_, Watchers> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, path: &str, id: u64) {
        let mut watchers = self.watchers();
        if let Some(list) = watchers.by_path.get_mut(path) {
            list.retain(|(watch_id, _)| *watch_id != id);
            if list.is_empty() {
                watchers.by_path.remove(path);
            }
        }
    }
}

/// Cloneable handle; clones share the same watchers.
#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<Inner>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `snapshot` to every live watcher of `path`.
    /// Returns the number of watchers notified.
    pub fn emit(&self, path: &str, snapshot: Snapshot) -> usize {
        // Snapshot the callbacks so none runs while the watcher lock is held.
        let callbacks: Vec<ChangeCallback> = self
            .inner
            .watchers()
            .by_path
            .get(path)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        for callback in &callbacks {
            callback(snapshot.clone());
        }
        callbacks.len()
    }

    /// Number of active watches on `path`.
    pub fn watch_count(&self, path: &str) -> usize {
        self.inner
            .watchers()
            .by_path
            .get(path)
            .map_or(0, Vec::len)
    }

    /// Number of active watches across all paths.
    pub fn total_watches(&self) -> usize {
        self.inner.watchers().by_path.values().map(Vec::len).sum()
    }

    /// Number of successful `watch` calls since creation.
    pub fn watches_started(&self) -> usize {
        self.inner.watches_started.load(Ordering::SeqCst)
    }

    /// Make the next `count` calls to `watch` fail.
    pub fn fail_next_watches(&self, count: usize) {
        self.inner.failures_pending.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.inner
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ChangeSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn watch(
        &self,
        path: &str,
        on_change: ChangeCallback,
    ) -> Result<WatchHandle, UpstreamError> {
        // Registration is asynchronous in real stores; give other tasks a turn.
        tokio::task::yield_now().await;

        if self.take_failure() {
            return Err(UpstreamError::Rejected {
                path: path.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .watchers()
            .by_path
            .entry(path.to_string())
            .or_default()
            .push((id, on_change));
        self.inner.watches_started.fetch_add(1, Ordering::SeqCst);
        debug!(path, id, "memory watch registered");

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let path = path.to_string();
        Ok(WatchHandle::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove(&path, id);
            }
        }))
    }
}
