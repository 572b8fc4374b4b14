//! Local tree walk.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub relative_path: String,
    pub absolute_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDir {
    pub relative_path: String,
    pub absolute_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Tracked documents, in walk order.
    pub files: Vec<LocalFile>,
    /// Directories, parents before children.
    pub dirs: Vec<LocalDir>,
}

/// Which paths take part in syncing.
#[derive(Debug, Clone)]
pub struct PathFilter {
    extension: String,
    ignore: Vec<String>,
}

impl PathFilter {
    pub fn new(extension: impl Into<String>, ignore: Vec<String>) -> Self {
        let extension = extension.into();
        Self {
            extension: extension.trim_start_matches('.').to_string(),
            ignore,
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Ignored names are skipped wherever they appear in a path.
    pub fn is_ignored_name(&self, name: &str) -> bool {
        self.ignore.iter().any(|ignored| ignored == name)
    }

    fn has_ignored_component(&self, relative_path: &str) -> bool {
        relative_path
            .split('/')
            .any(|component| self.is_ignored_name(component))
    }

    pub fn accepts_file(&self, relative_path: &str) -> bool {
        !self.has_ignored_component(relative_path)
            && Path::new(relative_path)
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == self.extension)
    }

    pub fn accepts_dir(&self, relative_path: &str) -> bool {
        !self.has_ignored_component(relative_path)
    }
}

/// `path` relative to `root`, `/`-separated.  `None` for paths outside
/// `root` and for `root` itself.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Walk `root` on a blocking thread.
pub async fn scan(root: &Path, filter: &PathFilter) -> Result<ScanResult> {
    let root = root.to_path_buf();
    let filter = filter.clone();
    tokio::task::spawn_blocking(move || scan_blocking(&root, &filter))
        .await
        .context("scan task panicked")?
}

/// Symlinks are followed.  Entries that cannot be read, including broken
/// links and link cycles, are logged and skipped.
pub fn scan_blocking(root: &Path, filter: &PathFilter) -> Result<ScanResult> {
    if !root.is_dir() {
        anyhow::bail!("{} is not a directory", root.display());
    }

    let mut result = ScanResult::default();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .is_none_or(|name| !filter.is_ignored_name(name))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                warn!(path, error = %err, "skipping unreadable entry");
                continue;
            }
        };

        let Some(relative) = relative_path(root, entry.path()) else {
            continue;
        };
        if entry.file_type().is_dir() {
            result.dirs.push(LocalDir {
                relative_path: relative,
                absolute_path: entry.path().to_path_buf(),
            });
        } else if entry.file_type().is_file() && filter.accepts_file(&relative) {
            result.files.push(LocalFile {
                relative_path: relative,
                absolute_path: entry.path().to_path_buf(),
            });
        }
    }

    Ok(result)
}
