//! Client for the remote page store: typed operations over a paced,
//! retrying request pipeline, plus the block differ used to patch pages in
//! place and the markdown conversion used on both sync directions.

pub mod api;
pub mod block;
pub mod client;
pub mod diff;
pub mod error;
pub mod http;
pub mod markdown;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod queue;
pub mod retry;

pub use api::{BlockPage, NotionApi};
pub use block::Block;
pub use client::{ChildPage, NotionClient, RemoteTreeNode};
pub use diff::{DiffOp, diff, needs_rewrite};
pub use error::{NotionError, Result};
pub use http::HttpNotionApi;
#[cfg(any(test, feature = "test-support"))]
pub use memory::InMemoryNotion;
pub use queue::RequestQueue;
pub use retry::RetryPolicy;
