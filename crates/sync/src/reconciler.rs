//! Local ⇄ remote reconciliation for one sync target.
//!
//! The in-memory [`SyncState`] is shared by every operation; it is locked
//! only for short read-modify-write sections and never while a remote call
//! is in flight, so each write goes against the live map rather than a stale
//! copy.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use notesync_notion::{NotionClient, RemoteTreeNode, markdown};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::lock::SyncLock;
use crate::scanner::{self, PathFilter};
use crate::state::{DirState, FileState, StateStore, SyncState, content_hash, fingerprint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// `(mtime, size)` matched the stored fingerprint.
    Unchanged,
    /// Empty or whitespace-only content; never pushed.
    Empty,
    /// Content hash matched despite a changed fingerprint.
    HashMatch,
    Created,
    Updated,
}

impl PushOutcome {
    pub fn wrote_remote(self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// A push was in flight; nothing was looked at.
    Skipped,
    Completed {
        /// Tracked files rewritten from remote.
        pulled: usize,
        /// Remote-only pages materialized locally.
        created: usize,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub pushed: usize,
    pub pulled: usize,
    pub created: usize,
    pub archived: usize,
}

pub struct Reconciler {
    client: NotionClient,
    store: StateStore,
    lock: Arc<SyncLock>,
    filter: PathFilter,
    root_id: String,
    dir: PathBuf,
    state: Mutex<SyncState>,
    /// Serializes directory creation so two pushes never create the same
    /// container twice.
    dir_guard: Mutex<()>,
    /// Held by the running pull pass; concurrent passes are dropped.
    pull_guard: Mutex<()>,
}

impl Reconciler {
    /// Load the persisted state for `(root_id, dir)`, or start empty.  An
    /// unreadable state file is an error.
    pub fn open(
        client: NotionClient,
        store: StateStore,
        lock: Arc<SyncLock>,
        filter: PathFilter,
        root_id: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let root_id = root_id.into();
        let dir = dir.into();
        let state = store.load_or_init(&root_id, &dir)?;
        Ok(Self {
            client,
            store,
            lock,
            filter,
            root_id,
            dir,
            state: Mutex::new(state),
            dir_guard: Mutex::new(()),
            pull_guard: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn lock(&self) -> &Arc<SyncLock> {
        &self.lock
    }

    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    pub async fn snapshot(&self) -> SyncState {
        self.state.lock().await.clone()
    }

    pub async fn persist(&self) -> Result<()> {
        let snapshot = self.snapshot().await;
        self.store.save(&snapshot).await
    }

    pub fn relative(&self, path: &Path) -> Result<String> {
        scanner::relative_path(&self.dir, path)
            .with_context(|| format!("{} is not inside {}", path.display(), self.dir.display()))
    }

    fn absolute(&self, relative_path: &str) -> PathBuf {
        relative_path
            .split('/')
            .fold(self.dir.clone(), |path, part| path.join(part))
    }

    // ── Startup ──────────────────────────────────────────────────────────

    /// Full two-way pass run once when the daemon starts.  Push failures
    /// abort the pass; pull-side failures are logged per item.
    pub async fn startup_sync(&self) -> Result<StartupReport> {
        info!(dir = %self.dir.display(), root = %self.root_id, "startup sync");
        let mut report = StartupReport::default();

        let scan = scanner::scan(&self.dir, &self.filter).await?;

        for dir in &scan.dirs {
            self.ensure_dir(&dir.relative_path)
                .await
                .with_context(|| format!("creating remote directory for {}", dir.relative_path))?;
        }

        let mut pushed = HashSet::new();
        for file in &scan.files {
            let outcome = self
                .sync_file(&file.absolute_path)
                .await
                .with_context(|| format!("pushing {}", file.relative_path))?;
            if outcome.wrote_remote() {
                report.pushed += 1;
                pushed.insert(file.relative_path.clone());
            }
        }

        let local = scan
            .files
            .iter()
            .map(|file| file.relative_path.clone())
            .collect::<HashSet<_>>();
        let pre_pull = self
            .state
            .lock()
            .await
            .files
            .keys()
            .cloned()
            .collect::<Vec<_>>();

        // Files just pushed already carry a fresh timestamp; files missing
        // locally are archived below instead of being pulled back.
        let to_pull = pre_pull
            .iter()
            .filter(|rel| !pushed.contains(*rel) && local.contains(*rel))
            .cloned()
            .collect::<Vec<_>>();
        report.pulled = self.pull_tracked(&to_pull).await;

        report.created = match self.pull_remote_only().await {
            Ok(created) => created,
            Err(err) => {
                warn!(error = %err, "remote tree fetch failed");
                0
            }
        };

        for rel in pre_pull.iter().filter(|rel| !local.contains(*rel)) {
            match self.archive_tracked_file(rel).await {
                Ok(true) => report.archived += 1,
                Ok(false) => {}
                Err(err) => warn!(path = %rel, error = %err, "archiving remote page failed"),
            }
        }

        self.persist().await?;
        info!(
            pushed = report.pushed,
            pulled = report.pulled,
            created = report.created,
            archived = report.archived,
            "startup sync complete"
        );
        Ok(report)
    }

    // ── Local → remote ───────────────────────────────────────────────────

    /// Remote page id for directory `relative_dir`, creating or reusing a
    /// container page for every missing level.
    pub async fn ensure_dir(&self, relative_dir: &str) -> Result<String> {
        let _dirs = self.dir_guard.lock().await;
        let mut parent_id = self.root_id.clone();
        let mut prefix = String::new();

        for part in relative_dir.split('/').filter(|part| !part.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);

            let known = self
                .state
                .lock()
                .await
                .dirs
                .get(&prefix)
                .map(|dir| dir.remote_id.clone());
            parent_id = match known {
                Some(id) => id,
                None => {
                    let id = match self.client.find_child_page(&parent_id, part).await? {
                        Some(id) => {
                            info!(path = %prefix, page_id = %id, "reusing remote directory");
                            id
                        }
                        None => self.client.create_page(&parent_id, part, &[]).await?,
                    };
                    self.state.lock().await.dirs.insert(
                        prefix.clone(),
                        DirState {
                            remote_id: id.clone(),
                        },
                    );
                    id
                }
            };
        }

        Ok(parent_id)
    }

    async fn parent_page_for(&self, relative_path: &str) -> Result<String> {
        match relative_path.rsplit_once('/') {
            Some((parent, _)) => self.ensure_dir(parent).await,
            None => Ok(self.root_id.clone()),
        }
    }

    /// Push one local document.
    pub async fn sync_file(&self, path: &Path) -> Result<PushOutcome> {
        let _push = self.lock.begin_push();
        let rel = self.relative(path)?;
        if !self.filter.accepts_file(&rel) {
            bail!("{rel} is not a tracked document");
        }

        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("reading metadata of {}", path.display()))?;
        let (mtime, size) = fingerprint(&meta);
        let tracked = self.state.lock().await.files.get(&rel).cloned();

        if let Some(file) = &tracked {
            if file.local_mtime.is_some()
                && file.local_size.is_some()
                && file.local_mtime == mtime
                && file.local_size == size
            {
                return Ok(PushOutcome::Unchanged);
            }
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if content.trim().is_empty() {
            debug!(path = %rel, "empty document, not pushing");
            return Ok(PushOutcome::Empty);
        }

        let hash = content_hash(&content);
        if tracked.as_ref().is_some_and(|file| file.content_hash == hash) {
            return Ok(PushOutcome::HashMatch);
        }

        let blocks = markdown::to_blocks(&content);
        let parent_id = self.parent_page_for(&rel).await?;
        let title = document_title(&rel);

        let (remote_id, outcome) = match tracked {
            Some(file) => {
                self.client
                    .update_page_content(&file.remote_id, &blocks)
                    .await?;
                (file.remote_id, PushOutcome::Updated)
            }
            None => match self.client.find_child_page(&parent_id, &title).await? {
                Some(existing) => {
                    info!(path = %rel, page_id = %existing, "reusing remote page");
                    self.client.update_page_content(&existing, &blocks).await?;
                    (existing, PushOutcome::Updated)
                }
                None => {
                    let created = self.client.create_page(&parent_id, &title, &blocks).await?;
                    (created, PushOutcome::Created)
                }
            },
        };

        let remote_last_edited = self.client.page_last_edited(&remote_id).await?;
        self.state.lock().await.files.insert(
            rel.clone(),
            FileState {
                remote_id,
                content_hash: hash,
                local_mtime: mtime,
                local_size: size,
                remote_last_edited,
                last_synced_at: Utc::now(),
            },
        );
        self.persist().await?;

        info!(path = %rel, ?outcome, "pushed document");
        Ok(outcome)
    }

    /// Archive the remote counterpart of a removed local path.  Removing a
    /// directory archives its container page and forgets everything below
    /// it.  Returns `false` for untracked paths.
    pub async fn delete_file(&self, path: &Path) -> Result<bool> {
        let _push = self.lock.begin_push();
        let rel = self.relative(path)?;

        if self.archive_tracked_file(&rel).await? {
            self.persist().await?;
            return Ok(true);
        }

        let dir_id = self
            .state
            .lock()
            .await
            .dirs
            .get(&rel)
            .map(|dir| dir.remote_id.clone());
        let Some(dir_id) = dir_id else {
            debug!(path = %rel, "untracked path removed");
            return Ok(false);
        };

        self.client.archive_page(&dir_id).await?;
        {
            let nested = format!("{rel}/");
            let mut state = self.state.lock().await;
            state.dirs.retain(|key, _| key != &rel && !key.starts_with(&nested));
            state.files.retain(|key, _| !key.starts_with(&nested));
        }
        self.persist().await?;
        info!(path = %rel, "archived remote directory");
        Ok(true)
    }

    async fn archive_tracked_file(&self, rel: &str) -> Result<bool> {
        let remote_id = self
            .state
            .lock()
            .await
            .files
            .get(rel)
            .map(|file| file.remote_id.clone());
        let Some(remote_id) = remote_id else {
            return Ok(false);
        };

        self.client.archive_page(&remote_id).await?;
        self.state.lock().await.files.remove(rel);
        info!(path = %rel, page_id = %remote_id, "archived remote page");
        Ok(true)
    }

    // ── Remote → local ───────────────────────────────────────────────────

    /// Catch up with remote edits: re-pull changed tracked documents, then
    /// materialize remote-only pages.  Skipped outright while any push or
    /// another pull is in flight.
    pub async fn pull_changes(&self) -> Result<PullOutcome> {
        if self.lock.is_pushing() {
            debug!("push in flight, skipping pull");
            return Ok(PullOutcome::Skipped);
        }
        let Ok(_pulling) = self.pull_guard.try_lock() else {
            debug!("pull already running, skipping");
            return Ok(PullOutcome::Skipped);
        };

        let tracked = self
            .state
            .lock()
            .await
            .files
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        let pulled = self.pull_tracked(&tracked).await;
        let created = self.pull_remote_only().await?;
        self.persist().await?;

        if pulled + created > 0 {
            info!(pulled, created, "pulled remote changes");
        }
        Ok(PullOutcome::Completed { pulled, created })
    }

    /// Pull each of `paths`; one failing document does not stop the rest.
    async fn pull_tracked(&self, paths: &[String]) -> usize {
        let mut pulled = 0;
        for rel in paths {
            match self.pull_file(rel).await {
                Ok(true) => pulled += 1,
                Ok(false) => {}
                Err(err) => warn!(path = %rel, error = %err, "pull failed"),
            }
        }
        pulled
    }

    async fn pull_file(&self, rel: &str) -> Result<bool> {
        let tracked = self.state.lock().await.files.get(rel).cloned();
        let Some(file) = tracked else {
            return Ok(false);
        };

        let edited = self.client.page_last_edited(&file.remote_id).await?;
        if edited == file.remote_last_edited {
            return Ok(false);
        }

        let content = self.client.page_markdown(&file.remote_id).await?;
        self.write_pulled(rel, &file.remote_id, &content, edited)
            .await?;
        info!(path = %rel, "pulled remote edit");
        Ok(true)
    }

    /// Walk the remote tree and create local counterparts for pages that
    /// are not tracked yet.  Empty remote documents are left alone.
    async fn pull_remote_only(&self) -> Result<usize> {
        let tree = self.client.fetch_tree(&self.root_id).await?;
        let mut pending = tree
            .into_iter()
            .rev()
            .map(|(title, node)| (local_name(&title), node))
            .collect::<Vec<(String, RemoteTreeNode)>>();
        let mut created = 0;

        while let Some((rel_base, node)) = pending.pop() {
            if node.children.is_empty() {
                let rel = format!("{rel_base}.{}", self.filter.extension());
                if self.is_tracked(&rel, &node.id).await {
                    continue;
                }
                match self.materialize_document(&rel, &node.id).await {
                    Ok(true) => created += 1,
                    Ok(false) => {}
                    Err(err) => warn!(path = %rel, error = %err, "pulling remote page failed"),
                }
                continue;
            }

            let tracked_elsewhere = {
                let state = self.state.lock().await;
                !state.dirs.contains_key(&rel_base) && state.tracks_remote_id(&node.id)
            };
            if tracked_elsewhere {
                continue;
            }
            if let Err(err) = self.materialize_dir(&rel_base, &node.id).await {
                warn!(path = %rel_base, error = %err, "creating local directory failed");
                continue;
            }

            pending.extend(
                node.children
                    .into_iter()
                    .rev()
                    .map(|(title, child)| (format!("{rel_base}/{}", local_name(&title)), child)),
            );
        }

        Ok(created)
    }

    async fn is_tracked(&self, rel: &str, remote_id: &str) -> bool {
        let state = self.state.lock().await;
        state.files.contains_key(rel) || state.tracks_remote_id(remote_id)
    }

    async fn materialize_dir(&self, rel: &str, remote_id: &str) -> Result<()> {
        if self.state.lock().await.dirs.contains_key(rel) {
            return Ok(());
        }
        tokio::fs::create_dir_all(self.absolute(rel)).await?;
        self.state.lock().await.dirs.insert(
            rel.to_string(),
            DirState {
                remote_id: remote_id.to_string(),
            },
        );
        info!(path = %rel, "created local directory");
        Ok(())
    }

    async fn materialize_document(&self, rel: &str, remote_id: &str) -> Result<bool> {
        let content = self.client.page_markdown(remote_id).await?;
        if content.trim().is_empty() {
            debug!(path = %rel, "remote page is empty, not creating file");
            return Ok(false);
        }
        let edited = self.client.page_last_edited(remote_id).await?;
        self.write_pulled(rel, remote_id, &content, edited).await?;
        info!(path = %rel, "created local document");
        Ok(true)
    }

    /// Write pulled content, hidden from the watcher, and record it.
    async fn write_pulled(
        &self,
        rel: &str,
        remote_id: &str,
        content: &str,
        remote_last_edited: String,
    ) -> Result<()> {
        let path = self.absolute(rel);
        self.lock.mark_pulled(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        let meta = tokio::fs::metadata(&path).await?;
        let (local_mtime, local_size) = fingerprint(&meta);
        self.state.lock().await.files.insert(
            rel.to_string(),
            FileState {
                remote_id: remote_id.to_string(),
                content_hash: content_hash(content),
                local_mtime,
                local_size,
                remote_last_edited,
                last_synced_at: Utc::now(),
            },
        );
        Ok(())
    }
}

/// Page title for a document: its file name without the extension.
fn document_title(relative_path: &str) -> String {
    let name = relative_path.rsplit('/').next().unwrap_or(relative_path);
    Path::new(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string())
}

/// File or directory name for a remote title.
fn local_name(title: &str) -> String {
    let cleaned = title.replace(['/', '\\'], "-");
    let cleaned = cleaned.trim().trim_start_matches('.');
    if cleaned.is_empty() {
        "Untitled".to_string()
    } else {
        cleaned.to_string()
    }
}
