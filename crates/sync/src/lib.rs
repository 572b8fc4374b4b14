//! Two-way synchronization between a local markdown tree and a remote page
//! tree: persisted per-target state, local scanning, the reconciler that
//! pushes and pulls, and the triggers that drive it (watcher, poller,
//! webhook).

pub mod lock;
pub mod poller;
pub mod reconciler;
pub mod scanner;
pub mod scheduler;
pub mod state;
pub mod watcher;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use lock::{PushGuard, SyncLock};
pub use poller::spawn_poller;
pub use reconciler::{PullOutcome, PushOutcome, Reconciler, StartupReport};
pub use scanner::{PathFilter, ScanResult};
pub use scheduler::{Debouncer, PathScheduler, local_change_action};
pub use state::{DirState, FileState, StateStore, SyncState};
pub use watcher::{WatcherHandle, start_watcher};
pub use webhook::{WebhookGate, WebhookOutcome};
