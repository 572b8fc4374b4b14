//! Coordination between the two sync directions.
//!
//! Pushes hold a [`PushGuard`] while they run; pull passes check
//! [`SyncLock::is_pushing`] and skip themselves instead of waiting.  Files
//! written by a pull are marked so the watcher can ignore the change events
//! those writes produce.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct SyncLock {
    active_pushes: AtomicUsize,
    suppress_window: Duration,
    pulled: Mutex<HashMap<String, Instant>>,
}

impl SyncLock {
    pub fn new(suppress_window: Duration) -> Self {
        Self {
            active_pushes: AtomicUsize::new(0),
            suppress_window,
            pulled: Mutex::new(HashMap::new()),
        }
    }

    /// Count a push as in flight until the returned guard is dropped.
    pub fn begin_push(self: &Arc<Self>) -> PushGuard {
        self.active_pushes.fetch_add(1, Ordering::SeqCst);
        PushGuard {
            lock: Arc::clone(self),
        }
    }

    pub fn is_pushing(&self) -> bool {
        self.active_pushes.load(Ordering::SeqCst) > 0
    }

    pub fn active_pushes(&self) -> usize {
        self.active_pushes.load(Ordering::SeqCst)
    }

    /// Record that `relative_path` is about to be written by a pull.
    pub fn mark_pulled(&self, relative_path: &str) {
        let mut pulled = self.pulled.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        pulled.retain(|_, at| now.duration_since(*at) < self.suppress_window);
        pulled.insert(relative_path.to_string(), now);
    }

    /// `true` while `relative_path` is inside its post-pull quiet window.
    pub fn is_suppressed(&self, relative_path: &str) -> bool {
        let pulled = self.pulled.lock().unwrap_or_else(PoisonError::into_inner);
        pulled
            .get(relative_path)
            .is_some_and(|at| at.elapsed() < self.suppress_window)
    }
}

/// Decrements the active push count on drop, so early returns and errors
/// cannot leave the count raised.
#[derive(Debug)]
pub struct PushGuard {
    lock: Arc<SyncLock>,
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        self.lock.active_pushes.fetch_sub(1, Ordering::SeqCst);
    }
}
