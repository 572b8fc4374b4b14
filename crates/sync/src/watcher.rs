//! Filesystem notifications for the sync directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::lock::SyncLock;
use crate::scanner::{PathFilter, relative_path};
use crate::scheduler::Debouncer;

/// Keeps the watcher alive; dropping or stopping it ends event delivery.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    shutdown_tx: oneshot::Sender<()>,
}

impl WatcherHandle {
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Relative path for an event on `path`, or `None` when the event should
/// not reach the debouncer.
fn event_target(root: &Path, filter: &PathFilter, lock: &SyncLock, path: &Path) -> Option<String> {
    let rel = relative_path(root, path)?;
    let accepted = match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => false,
        Ok(_) => filter.accepts_file(&rel),
        // Gone: could have been a document or a whole directory.
        Err(_) => filter.accepts_dir(&rel),
    };
    if !accepted {
        return None;
    }
    if lock.is_suppressed(&rel) {
        debug!(path = %rel, "ignoring change written by pull");
        return None;
    }
    Some(rel)
}

/// Watch `root` recursively and feed relevant changes to `debouncer`.
pub fn start_watcher(
    root: PathBuf,
    filter: PathFilter,
    lock: Arc<SyncLock>,
    debouncer: Arc<Debouncer>,
) -> Result<WatcherHandle> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
            Err(err) => warn!(error = %err, "watch error"),
        },
        notify::Config::default(),
    )
    .context("creating file watcher")?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("watching {}", root.display()))?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let watch_root = root.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("file watcher shutting down");
                    break;
                }
                received = rx.recv() => {
                    let Some(path) = received else { break };
                    if let Some(rel) = event_target(&watch_root, &filter, &lock, &path) {
                        debug!(path = %rel, "local change");
                        debouncer.schedule(path);
                    }
                }
            }
        }
    });

    info!(path = %root.display(), "file watcher started");
    Ok(WatcherHandle {
        _watcher: watcher,
        shutdown_tx,
    })
}
