use std::fs;
use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use fs2::FileExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use notesync_config::AppConfig;
use notesync_notion::{HttpNotionApi, NotionClient};
use notesync_sync::state::target_key;
use notesync_sync::{
    Debouncer, PathFilter, PathScheduler, Reconciler, StateStore, SyncLock, WebhookGate,
    local_change_action, spawn_poller, start_watcher,
};

use crate::webhook_server;

/// Per-target files under the state directory, all named after the
/// target key so several daemons can share one state directory.
#[derive(Debug, Clone)]
pub(crate) struct TargetPaths {
    pub(crate) state_dir: PathBuf,
    key: String,
    pub(crate) pid_file: PathBuf,
    pub(crate) lock_file: PathBuf,
}

impl TargetPaths {
    pub(crate) fn new(state_dir: &Path, root_id: &str, dir: &Path) -> Self {
        let key = target_key(root_id, dir);
        Self {
            pid_file: state_dir.join(format!("{key}.pid")),
            lock_file: state_dir.join(format!("{key}.lock")),
            state_dir: state_dir.to_path_buf(),
            key,
        }
    }

    pub(crate) fn log_file_name(&self) -> String {
        format!("{}.log", self.key)
    }

    pub(crate) fn create_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("creating {}", self.state_dir.display()))
    }

    /// Hold the target lock for as long as the returned file is open.
    fn acquire(&self) -> Result<File> {
        self.create_dir()?;
        let lock_file = File::create(&self.lock_file)?;
        lock_file.try_lock_exclusive().map_err(|_| {
            anyhow!(
                "another notesync process already holds {}",
                self.lock_file.display()
            )
        })?;
        Ok(lock_file)
    }
}

/// Absolute, symlink-free form of `dir`, so the same directory always maps
/// to the same target key.
pub(crate) fn resolve_dir(dir: &Path) -> Result<PathBuf> {
    let resolved = dir
        .canonicalize()
        .with_context(|| format!("sync directory {} not found", dir.display()))?;
    if !resolved.is_dir() {
        bail!("{} is not a directory", resolved.display());
    }
    Ok(resolved)
}

fn open_reconciler(
    config: &AppConfig,
    root_id: &str,
    dir: &Path,
    lock: Arc<SyncLock>,
) -> Result<Reconciler> {
    if !config.has_token() {
        bail!("no Notion token configured; set NOTION_TOKEN or [notion].token");
    }
    let api = Arc::new(HttpNotionApi::new(&config.notion)?);
    let client = NotionClient::new(api, &config.notion);
    let store = StateStore::for_target(&config.daemon.state_dir(), root_id, dir);
    Reconciler::open(client, store, lock, sync_filter(config, dir), root_id, dir)
}

/// The configured filter, plus the state directory's own name when it lives
/// inside the synced tree.
fn sync_filter(config: &AppConfig, dir: &Path) -> PathFilter {
    let mut ignore = config.sync.ignore.clone();
    let state_dir = config.daemon.state_dir();
    let state_dir = state_dir.canonicalize().unwrap_or(state_dir);
    let inside = state_dir
        .strip_prefix(dir)
        .ok()
        .and_then(|rest| rest.components().next());
    if let Some(Component::Normal(name)) = inside {
        let name = name.to_string_lossy().to_string();
        if !ignore.contains(&name) {
            ignore.push(name);
        }
    }
    PathFilter::new(config.sync.extension.as_str(), ignore)
}

pub(crate) async fn sync_once(config: &AppConfig, dir: &Path, root_id: &str) -> Result<()> {
    let paths = TargetPaths::new(&config.daemon.state_dir(), root_id, dir);
    let _lock_file = paths.acquire()?;

    let lock = Arc::new(SyncLock::new(config.sync.pull_suppress()));
    let reconciler = open_reconciler(config, root_id, dir, lock)?;
    let report = reconciler.startup_sync().await?;

    println!("sync complete");
    println!("- pushed: {}", report.pushed);
    println!("- pulled: {}", report.pulled);
    println!("- created locally: {}", report.created);
    println!("- archived remotely: {}", report.archived);
    Ok(())
}

pub(crate) fn print_status(config: &AppConfig, dir: &Path, root_id: &str) -> Result<()> {
    let state_dir = config.daemon.state_dir();
    let paths = TargetPaths::new(&state_dir, root_id, dir);
    let store = StateStore::for_target(&state_dir, root_id, dir);

    println!("target: {} -> {root_id}", dir.display());
    println!("- state: {}", store.path().display());
    match store.load()? {
        Some(state) => {
            println!("- tracked files: {}", state.files.len());
            println!("- tracked directories: {}", state.dirs.len());
            if let Some(last) = state.files.values().map(|file| file.last_synced_at).max() {
                println!("- last synced: {}", last.to_rfc3339());
            }
        }
        None => println!("- never synced"),
    }

    match read_pid(&paths.pid_file)? {
        Some(pid) if is_pid_running(pid) => println!("daemon status: running (pid {pid})"),
        Some(pid) => println!("daemon status: stopped (stale pid {pid})"),
        None => println!("daemon status: stopped"),
    }
    println!("- log: {}", paths.state_dir.join(paths.log_file_name()).display());
    Ok(())
}

pub(crate) fn read_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)?;
    Ok(raw.trim().parse::<u32>().ok())
}

pub(crate) fn is_pid_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Foreground daemon for one target.  The pid and lock files are removed on
/// every exit path, including a failed startup sync.
pub(crate) async fn run_daemon(
    config: AppConfig,
    dir: PathBuf,
    root_id: String,
    paths: TargetPaths,
) -> Result<()> {
    let lock_file = paths.acquire()?;
    fs::write(&paths.pid_file, std::process::id().to_string())?;

    let result = serve(&config, &dir, &root_id).await;

    let _ = fs::remove_file(&paths.pid_file);
    drop(lock_file);
    let _ = fs::remove_file(&paths.lock_file);
    result
}

async fn serve(config: &AppConfig, dir: &Path, root_id: &str) -> Result<()> {
    let lock = Arc::new(SyncLock::new(config.sync.pull_suppress()));
    let reconciler = Arc::new(open_reconciler(config, root_id, dir, lock)?);
    reconciler
        .startup_sync()
        .await
        .context("startup sync failed")?;

    let scheduler = PathScheduler::new(local_change_action(Arc::clone(&reconciler)));
    let debouncer = Arc::new(Debouncer::new(config.sync.debounce(), scheduler.clone()));
    let watcher = start_watcher(
        dir.to_path_buf(),
        reconciler.filter().clone(),
        Arc::clone(reconciler.lock()),
        Arc::clone(&debouncer),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = spawn_poller(
        Arc::clone(&reconciler),
        config.sync.poll_interval(),
        shutdown_rx.clone(),
    );

    let webhook = if config.webhook.enabled {
        let listener = TcpListener::bind(&config.webhook.bind)
            .await
            .with_context(|| format!("binding webhook listener on {}", config.webhook.bind))?;
        let gate = Arc::new(WebhookGate::new(Arc::clone(&reconciler)));
        let server = webhook_server::spawn_webhook_server(listener, Arc::clone(&gate), shutdown_rx)?;
        Some((gate, server))
    } else {
        None
    };

    info!(dir = %dir.display(), root = %root_id, "daemon running");
    wait_for_signal().await?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    watcher.stop();
    debouncer.cancel_all();
    scheduler.wait_idle().await;
    let _ = poller.await;
    if let Some((gate, server)) = webhook {
        let _ = server.await;
        gate.wait_idle().await;
    }

    reconciler.persist().await?;
    info!("daemon stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
