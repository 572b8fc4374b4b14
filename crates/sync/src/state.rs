//! Persisted fingerprint map for one sync target.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileState {
    pub remote_id: String,
    /// Hash of the local content last pushed or pulled.
    pub content_hash: String,
    /// Modification time in milliseconds since the epoch.
    pub local_mtime: Option<i64>,
    pub local_size: Option<u64>,
    /// Remote `last_edited_time` observed right after our last write or pull.
    pub remote_last_edited: String,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirState {
    pub remote_id: String,
}

/// Keys of `files` and `dirs` are `/`-separated paths relative to `dir_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub root_id: String,
    pub dir_path: PathBuf,
    #[serde(default)]
    pub files: BTreeMap<String, FileState>,
    #[serde(default)]
    pub dirs: BTreeMap<String, DirState>,
}

impl SyncState {
    pub fn new(root_id: impl Into<String>, dir_path: impl Into<PathBuf>) -> Self {
        Self {
            root_id: root_id.into(),
            dir_path: dir_path.into(),
            files: BTreeMap::new(),
            dirs: BTreeMap::new(),
        }
    }

    /// Remote id already tracked for `relative_path`, file or directory.
    pub fn remote_id(&self, relative_path: &str) -> Option<&str> {
        self.files
            .get(relative_path)
            .map(|file| file.remote_id.as_str())
            .or_else(|| self.dirs.get(relative_path).map(|dir| dir.remote_id.as_str()))
    }

    pub fn tracks_remote_id(&self, remote_id: &str) -> bool {
        self.files.values().any(|file| file.remote_id == remote_id)
            || self.dirs.values().any(|dir| dir.remote_id == remote_id)
    }
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fast-path fingerprint: `(mtime in ms, size)`.
pub fn fingerprint(meta: &fs::Metadata) -> (Option<i64>, Option<u64>) {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .and_then(|since| i64::try_from(since.as_millis()).ok());
    (mtime, Some(meta.len()))
}

/// Location and persistence of the state file.  Saves are serialized so two
/// concurrent writers never interleave on the temp file.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    persist: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            persist: Mutex::new(()),
        }
    }

    /// The store for `(root_id, dir)` under `state_dir`.  The file name is a
    /// truncated hash of both, so each target gets its own file.
    pub fn for_target(state_dir: &Path, root_id: &str, dir: &Path) -> Self {
        Self::new(state_dir.join(format!("{}.json", target_key(root_id, dir))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no state was saved yet.  A file that exists but
    /// cannot be parsed is an error and is left untouched.
    pub fn load(&self) -> Result<Option<SyncState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading sync state {}", self.path.display()))?;
        let state = serde_json::from_str(&raw)
            .with_context(|| format!("sync state {} is corrupt", self.path.display()))?;
        Ok(Some(state))
    }

    pub fn load_or_init(&self, root_id: &str, dir: &Path) -> Result<SyncState> {
        Ok(self
            .load()?
            .unwrap_or_else(|| SyncState::new(root_id, dir)))
    }

    /// Write via a `.tmp` sibling and rename, so a crash mid-write keeps the
    /// previous state intact.
    pub async fn save(&self, state: &SyncState) -> Result<()> {
        let _guard = self.persist.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "state.json".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let rendered = serde_json::to_vec_pretty(state)?;
        let write_result: Result<()> = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&rendered).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }
}

/// 16 hex chars of `sha256("{root_id}:{dir}")`.
pub fn target_key(root_id: &str, dir: &Path) -> String {
    let digest = content_hash(&format!("{root_id}:{}", dir.display()));
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_file() -> FileState {
        FileState {
            remote_id: "page-1".to_string(),
            content_hash: content_hash("hello"),
            local_mtime: Some(1_700_000_000_000),
            local_size: Some(5),
            remote_last_edited: "2026-01-01T00:00:00.000Z".to_string(),
            last_synced_at: Utc::now(),
        }
    }

    #[test]
    fn hash_is_hex_sha256() {
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn target_key_is_stable_and_distinct() {
        let a = target_key("root", Path::new("/notes"));
        assert_eq!(a.len(), 16);
        assert_eq!(a, target_key("root", Path::new("/notes")));
        assert_ne!(a, target_key("root", Path::new("/other")));
        assert_ne!(a, target_key("other", Path::new("/notes")));
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::for_target(dir.path(), "root", Path::new("/notes"));
        assert!(store.load().unwrap().is_none());

        let state = store.load_or_init("root", Path::new("/notes")).unwrap();
        assert_eq!(state.root_id, "root");
        assert!(state.files.is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error_and_kept() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        fs::write(store.path(), "{ not json").unwrap();

        let err = store.load_or_init("root", Path::new("/notes")).unwrap_err();
        assert!(err.to_string().contains("corrupt"));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("nested/state.json"));
        let mut state = SyncState::new("root", "/notes");
        state.files.insert("a/b.md".to_string(), sample_file());
        state.dirs.insert(
            "a".to_string(),
            DirState {
                remote_id: "page-dir".to_string(),
            },
        );

        store.save(&state).await.unwrap();

        assert_eq!(store.load().unwrap(), Some(state));
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[tokio::test]
    async fn serialized_keys_are_camel_case() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let mut state = SyncState::new("root", "/notes");
        state.files.insert("x.md".to_string(), sample_file());
        store.save(&state).await.unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        for key in ["rootId", "dirPath", "remoteId", "contentHash", "localMtime", "remoteLastEdited", "lastSyncedAt"] {
            assert!(raw.contains(key), "missing {key} in {raw}");
        }
    }

    #[test]
    fn remote_id_lookup_covers_files_and_dirs() {
        let mut state = SyncState::new("root", "/notes");
        state.files.insert("a.md".to_string(), sample_file());
        state.dirs.insert(
            "d".to_string(),
            DirState {
                remote_id: "page-dir".to_string(),
            },
        );
        assert_eq!(state.remote_id("a.md"), Some("page-1"));
        assert_eq!(state.remote_id("d"), Some("page-dir"));
        assert_eq!(state.remote_id("zzz"), None);
        assert!(state.tracks_remote_id("page-dir"));
        assert!(!state.tracks_remote_id("page-9"));
    }
}
