//! Shared fixtures for tests that drive a [`Reconciler`] against the
//! in-memory remote.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notesync_config::NotionConfig;
use notesync_notion::NotionClient;
use notesync_notion::memory::{Call, InMemoryNotion, ROOT_PAGE_ID};
use tempfile::TempDir;

use crate::lock::SyncLock;
use crate::reconciler::Reconciler;
use crate::scanner::PathFilter;
use crate::state::StateStore;

pub(crate) struct Harness {
    _tmp: TempDir,
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub notion: Arc<InMemoryNotion>,
    pub lock: Arc<SyncLock>,
    pub config: NotionConfig,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("notes");
        let state_dir = tmp.path().join("state");
        fs::create_dir_all(&root).unwrap();
        Self {
            _tmp: tmp,
            root,
            state_dir,
            notion: Arc::new(InMemoryNotion::new()),
            lock: Arc::new(SyncLock::new(Duration::from_secs(2))),
            config: NotionConfig {
                request_interval_ms: 0,
                retry_base_delay_ms: 1,
                ..NotionConfig::default()
            },
        }
    }

    pub fn open(&self) -> Result<Reconciler> {
        let client = NotionClient::new(self.notion.clone(), &self.config);
        let store = StateStore::for_target(&self.state_dir, ROOT_PAGE_ID, &self.root);
        Reconciler::open(
            client,
            store,
            self.lock.clone(),
            PathFilter::new("md", vec!["node_modules".to_string()]),
            ROOT_PAGE_ID,
            &self.root,
        )
    }

    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.root.join(rel)).unwrap()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.notion.calls().iter().filter(|call| pred(call)).count()
    }
}
