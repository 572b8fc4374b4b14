//! Turning filesystem notifications into sync runs.
//!
//! [`Debouncer`] waits for a path to go quiet before handing it to the
//! [`PathScheduler`], which runs at most one action per path at a time and
//! folds triggers that arrive mid-run into a single rerun.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::reconciler::Reconciler;

pub type Action = Arc<dyn Fn(PathBuf) -> BoxFuture<'static, ()> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct PathScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    action: Action,
    /// Paths with a run in flight, and whether another run was requested.
    running: Mutex<HashMap<PathBuf, bool>>,
    idle: Notify,
}

impl PathScheduler {
    pub fn new(action: Action) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                action,
                running: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    /// Run the action for `path` now, or once more after the current run.
    pub fn trigger(&self, path: PathBuf) {
        {
            let mut running = lock(&self.inner.running);
            if let Some(rerun) = running.get_mut(&path) {
                *rerun = true;
                debug!(path = %path.display(), "sync in flight, queued one rerun");
                return;
            }
            running.insert(path.clone(), false);
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.drive(path).await });
    }

    pub fn is_running(&self, path: &PathBuf) -> bool {
        lock(&self.inner.running).contains_key(path)
    }

    /// Resolve once no path has a run in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock(&self.inner.running).is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl SchedulerInner {
    async fn drive(self: Arc<Self>, path: PathBuf) {
        loop {
            (self.action)(path.clone()).await;

            let mut running = lock(&self.running);
            match running.get_mut(&path) {
                Some(rerun) if *rerun => *rerun = false,
                _ => {
                    running.remove(&path);
                    if running.is_empty() {
                        self.idle.notify_waiters();
                    }
                    return;
                }
            }
        }
    }
}

/// Cancel-and-reschedule timers keyed by path.
pub struct Debouncer {
    delay: Duration,
    scheduler: PathScheduler,
    timers: Arc<Mutex<HashMap<PathBuf, (u64, JoinHandle<()>)>>>,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl Debouncer {
    pub fn new(delay: Duration, scheduler: PathScheduler) -> Self {
        Self {
            delay,
            scheduler,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// (Re)start the quiet window for `path`.
    pub fn schedule(&self, path: PathBuf) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);

        // The timer task takes the same lock before firing, so it cannot
        // observe the map before its own entry is in place.
        let mut timers = lock(&self.timers);
        let handle = {
            let timers = Arc::clone(&self.timers);
            let scheduler = self.scheduler.clone();
            let delay = self.delay;
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let current = {
                    let mut timers = lock(&timers);
                    match timers.get(&path) {
                        Some((owner, _)) if *owner == generation => {
                            timers.remove(&path);
                            true
                        }
                        _ => false,
                    }
                };
                if current {
                    scheduler.trigger(path);
                }
            })
        };
        if let Some((_, previous)) = timers.insert(path, (generation, handle)) {
            previous.abort();
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.timers).len()
    }

    /// Drop every pending timer and refuse new ones.
    pub fn cancel_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, (_, handle)) in lock(&self.timers).drain() {
            handle.abort();
        }
    }
}

/// Push an existing document, or archive the remote side of a removed path.
pub fn local_change_action(reconciler: Arc<Reconciler>) -> Action {
    Arc::new(move |path: PathBuf| {
        let reconciler = Arc::clone(&reconciler);
        async move {
            let result = match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => reconciler.sync_file(&path).await.map(drop),
                Ok(_) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    reconciler.delete_file(&path).await.map(drop)
                }
                Err(err) => Err(err.into()),
            };
            if let Err(err) = result {
                error!(path = %path.display(), error = %format!("{err:#}"), "local change sync failed");
            }
        }
        .boxed()
    })
}
