//! Raw remote operations, one method per endpoint.
//!
//! Implementations perform a single request each; pacing and retries are
//! layered on top by [`crate::NotionClient`].

use async_trait::async_trait;
use serde_json::Value;

use crate::block::Block;
use crate::error::Result;

/// One page of a paginated children listing.
#[derive(Debug, Clone, Default)]
pub struct BlockPage {
    /// Non-archived children, in document order.
    pub blocks: Vec<Block>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait NotionApi: Send + Sync {
    async fn list_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
        page_size: usize,
    ) -> Result<BlockPage>;

    /// Create a page under `parent_id` and return its id.  `children` must
    /// already respect the batch limit.
    async fn create_page(&self, parent_id: &str, title: &str, children: &[Block])
    -> Result<String>;

    /// Append `children` under `block_id`, after the sibling `after` when
    /// given, otherwise at the end.  Returns the created blocks in order.
    async fn append_children(
        &self,
        block_id: &str,
        children: &[Block],
        after: Option<&str>,
    ) -> Result<Vec<Block>>;

    /// Archive a block.  Deleting an already archived block is not an error.
    async fn delete_block(&self, block_id: &str) -> Result<()>;

    /// Replace the type-specific payload of an existing block.
    async fn update_block(&self, block_id: &str, block: &Block) -> Result<()>;

    async fn set_page_archived(&self, page_id: &str, archived: bool) -> Result<()>;

    /// The raw page object.
    async fn retrieve_page(&self, page_id: &str) -> Result<Value>;
}
