//! In-process stand-in for the remote API.
//!
//! Keeps a page/block tree in memory, honours the same ordering and archive
//! rules as the real service, and records every call so tests can assert on
//! the exact remote traffic an operation produced.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::api::{BlockPage, NotionApi};
use crate::block::Block;
use crate::error::{NotionError, Result};

pub const ROOT_PAGE_ID: &str = "root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListChildren(String),
    CreatePage { parent: String, title: String },
    AppendChildren {
        parent: String,
        count: usize,
        after: Option<String>,
    },
    DeleteBlock(String),
    UpdateBlock(String),
    SetPageArchived { page: String, archived: bool },
    RetrievePage(String),
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::ListChildren(_) | Self::RetrievePage(_))
    }
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<String>,
    block: Block,
    children: Vec<String>,
    archived: bool,
    last_edited: String,
    hide_last_edited: bool,
}

impl Node {
    fn is_page(&self) -> bool {
        self.block.kind == "child_page"
    }
}

#[derive(Debug, Default)]
struct Inner {
    nodes: HashMap<String, Node>,
    next_id: u64,
    clock: u64,
    calls: Vec<Call>,
    pending_rate_limits: u32,
}

impl Inner {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn tick(&mut self) -> String {
        self.clock += 1;
        format!("t{:08}", self.clock)
    }

    fn live(&self, id: &str) -> Result<&Node> {
        match self.nodes.get(id) {
            Some(node) if !node.archived => Ok(node),
            _ => Err(not_found(id)),
        }
    }

    /// Bump the last-edited stamp of the page that owns `id`.
    fn touch(&mut self, id: &str) {
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            let Some(node) = self.nodes.get(&current) else {
                return;
            };
            if node.is_page() {
                let stamp = self.tick();
                if let Some(node) = self.nodes.get_mut(&current) {
                    node.last_edited = stamp;
                }
                return;
            }
            cursor = node.parent.clone();
        }
    }

    fn insert_node(&mut self, parent: &str, block: Block, at: usize) -> String {
        let prefix = if block.kind == "child_page" { "page" } else { "block" };
        let id = self.fresh_id(prefix);
        let stamp = self.tick();
        self.nodes.insert(
            id.clone(),
            Node {
                parent: Some(parent.to_string()),
                block: block.with_id(id.clone()),
                children: Vec::new(),
                archived: false,
                last_edited: stamp,
                hide_last_edited: false,
            },
        );
        if let Some(parent) = self.nodes.get_mut(parent) {
            let at = at.min(parent.children.len());
            parent.children.insert(at, id.clone());
        }
        id
    }

    fn live_children(&self, id: &str) -> Vec<&Node> {
        self.nodes
            .get(id)
            .map(|node| {
                node.children
                    .iter()
                    .filter_map(|child| self.nodes.get(child))
                    .filter(|child| !child.archived)
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn not_found(id: &str) -> NotionError {
    NotionError::Api {
        status: 404,
        code: "object_not_found".to_string(),
        message: format!("Could not find block with ID: {id}."),
    }
}

fn validation(message: impl Into<String>) -> NotionError {
    NotionError::Api {
        status: 400,
        code: "validation_error".to_string(),
        message: message.into(),
    }
}

#[derive(Debug)]
pub struct InMemoryNotion {
    inner: Mutex<Inner>,
}

impl Default for InMemoryNotion {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNotion {
    /// A workspace holding a single empty root page, [`ROOT_PAGE_ID`].
    pub fn new() -> Self {
        let mut inner = Inner::default();
        let stamp = inner.tick();
        inner.nodes.insert(
            ROOT_PAGE_ID.to_string(),
            Node {
                parent: None,
                block: Block::child_page("Root").with_id(ROOT_PAGE_ID),
                children: Vec::new(),
                archived: false,
                last_edited: stamp,
                hide_last_edited: false,
            },
        );
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Log `call`, then fail it if a rate limit was injected.
    fn record(&self, call: Call) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        inner.calls.push(call);
        if inner.pending_rate_limits > 0 {
            inner.pending_rate_limits -= 1;
            return Err(NotionError::rate_limited("injected rate limit"));
        }
        Ok(inner)
    }

    // ── Fixture helpers (never logged as calls) ──────────────────────────

    pub fn add_page(&self, parent_id: &str, title: &str) -> String {
        let mut inner = self.lock();
        let id = inner.insert_node(parent_id, Block::child_page(title), usize::MAX);
        inner.touch(parent_id);
        id
    }

    /// Replace the content blocks of a page, leaving child pages in place.
    /// Bumps the page's last-edited stamp like a remote edit would.
    pub fn set_page_blocks(&self, page_id: &str, blocks: Vec<Block>) {
        let mut inner = self.lock();
        let existing = inner
            .live_children(page_id)
            .into_iter()
            .filter(|node| !node.block.is_container())
            .filter_map(|node| node.block.id.clone())
            .collect::<Vec<_>>();
        for id in existing {
            if let Some(node) = inner.nodes.get_mut(&id) {
                node.archived = true;
            }
        }
        for block in blocks {
            inner.insert_node(page_id, block, usize::MAX);
        }
        inner.touch(page_id);
    }

    /// Live content blocks of a page, in order, with their ids.
    pub fn page_blocks(&self, page_id: &str) -> Vec<Block> {
        self.lock()
            .live_children(page_id)
            .into_iter()
            .filter(|node| !node.block.is_container())
            .map(|node| node.block.clone())
            .collect()
    }

    /// Live child pages of `parent_id` as `(id, title)`, in order.
    pub fn child_pages(&self, parent_id: &str) -> Vec<(String, String)> {
        self.lock()
            .live_children(parent_id)
            .into_iter()
            .filter_map(|node| {
                let title = node.block.child_title()?.to_string();
                Some((node.block.id.clone()?, title))
            })
            .collect()
    }

    pub fn is_archived(&self, id: &str) -> bool {
        self.lock().nodes.get(id).is_none_or(|node| node.archived)
    }

    pub fn last_edited(&self, page_id: &str) -> Option<String> {
        self.lock()
            .nodes
            .get(page_id)
            .map(|node| node.last_edited.clone())
    }

    /// Make `retrieve_page` omit `last_edited_time` for this page.
    pub fn hide_last_edited(&self, page_id: &str) {
        if let Some(node) = self.lock().nodes.get_mut(page_id) {
            node.hide_last_edited = true;
        }
    }

    /// Fail the next `n` calls of any kind with a rate-limit error.
    pub fn fail_next_with_rate_limit(&self, n: u32) {
        self.lock().pending_rate_limits = n;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn mutation_count(&self) -> usize {
        self.lock().calls.iter().filter(|call| call.is_mutation()).count()
    }
}

#[async_trait]
impl NotionApi for InMemoryNotion {
    async fn list_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<BlockPage> {
        let inner = self.record(Call::ListChildren(block_id.to_string()))?;
        inner.live(block_id)?;

        let start = cursor
            .map(|raw| {
                raw.parse::<usize>()
                    .map_err(|_| validation(format!("invalid start_cursor {raw}")))
            })
            .transpose()?
            .unwrap_or(0);
        let page_size = page_size.max(1);
        let children = inner.live_children(block_id);
        let blocks = children
            .iter()
            .skip(start)
            .take(page_size)
            .map(|node| node.block.clone())
            .collect::<Vec<_>>();
        let end = start + blocks.len();
        let next_cursor = (end < children.len()).then(|| end.to_string());

        Ok(BlockPage {
            blocks,
            next_cursor,
        })
    }

    async fn create_page(
        &self,
        parent_id: &str,
        title: &str,
        children: &[Block],
    ) -> Result<String> {
        let mut inner = self.record(Call::CreatePage {
            parent: parent_id.to_string(),
            title: title.to_string(),
        })?;
        inner.live(parent_id)?;

        let id = inner.insert_node(parent_id, Block::child_page(title), usize::MAX);
        for block in children {
            inner.insert_node(&id, block.clone(), usize::MAX);
        }
        inner.touch(&id);
        Ok(id)
    }

    async fn append_children(
        &self,
        block_id: &str,
        children: &[Block],
        after: Option<&str>,
    ) -> Result<Vec<Block>> {
        let mut inner = self.record(Call::AppendChildren {
            parent: block_id.to_string(),
            count: children.len(),
            after: after.map(ToString::to_string),
        })?;
        let siblings = inner.live(block_id)?.children.clone();

        let mut at = match after {
            Some(anchor) => {
                let position = siblings
                    .iter()
                    .position(|id| id == anchor)
                    .filter(|_| inner.live(anchor).is_ok())
                    .ok_or_else(|| validation(format!("{anchor} is not a child of {block_id}")))?;
                position + 1
            }
            None => siblings.len(),
        };

        let mut created = Vec::with_capacity(children.len());
        for block in children {
            let id = inner.insert_node(block_id, block.clone(), at);
            at += 1;
            if let Some(node) = inner.nodes.get(&id) {
                created.push(node.block.clone());
            }
        }
        inner.touch(block_id);
        Ok(created)
    }

    async fn delete_block(&self, block_id: &str) -> Result<()> {
        let mut inner = self.record(Call::DeleteBlock(block_id.to_string()))?;
        let Some(node) = inner.nodes.get_mut(block_id) else {
            return Err(not_found(block_id));
        };
        node.archived = true;
        inner.touch(block_id);
        Ok(())
    }

    async fn update_block(&self, block_id: &str, block: &Block) -> Result<()> {
        let mut inner = self.record(Call::UpdateBlock(block_id.to_string()))?;
        let current_kind = inner.live(block_id)?.block.kind.clone();
        if current_kind != block.kind {
            return Err(validation(format!(
                "cannot change block type from {current_kind} to {}",
                block.kind
            )));
        }
        if let Some(node) = inner.nodes.get_mut(block_id) {
            node.block.payload = block.payload.clone();
        }
        inner.touch(block_id);
        Ok(())
    }

    async fn set_page_archived(&self, page_id: &str, archived: bool) -> Result<()> {
        let mut inner = self.record(Call::SetPageArchived {
            page: page_id.to_string(),
            archived,
        })?;
        let Some(node) = inner.nodes.get_mut(page_id) else {
            return Err(not_found(page_id));
        };
        node.archived = archived;
        Ok(())
    }

    async fn retrieve_page(&self, page_id: &str) -> Result<Value> {
        let inner = self.record(Call::RetrievePage(page_id.to_string()))?;
        let node = inner.nodes.get(page_id).ok_or_else(|| not_found(page_id))?;
        let mut page = json!({
            "object": "page",
            "id": page_id,
            "archived": node.archived,
        });
        if !node.hide_last_edited {
            page["last_edited_time"] = json!(node.last_edited);
        }
        Ok(page)
    }
}
