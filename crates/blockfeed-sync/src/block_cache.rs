//! Single-window prefetch cache over `get_blocks`.
//!
//! Access is strictly sequential, so the cache holds one contiguous window of
//! upstream blocks. A miss discards the whole window and fetches the next one;
//! a hit hands the block out and drops it from the window.

use std::collections::HashMap;

use blockfeed_core::error::FeedError;
use blockfeed_core::upstream::{UpstreamBlock, UpstreamClient};

#[derive(Debug, Default)]
pub struct BlockCache {
    blocks: HashMap<u64, UpstreamBlock>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return block `index`, fetching `[index, index + prefetch)` on a miss.
    pub async fn get(
        &mut self,
        client: &dyn UpstreamClient,
        index: u64,
        prefetch: u64,
        min_message_index: Option<i64>,
    ) -> Result<UpstreamBlock, FeedError> {
        if let Some(block) = self.blocks.remove(&index) {
            return Ok(block);
        }

        self.blocks.clear();
        let prefetch = prefetch.max(1);
        let indexes: Vec<u64> = (index..index.saturating_add(prefetch)).collect();
        let fetched = client.get_blocks(&indexes, min_message_index).await?;
        tracing::debug!(
            from = index,
            requested = indexes.len(),
            received = fetched.len(),
            "block window fetched"
        );
        self.blocks
            .extend(fetched.into_iter().map(|b| (b.block_index, b)));

        self.blocks.remove(&index).ok_or_else(|| {
            FeedError::Upstream(format!("block {index} missing from get_blocks response"))
        })
    }

    /// Drop the whole window.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn contains(&self, index: u64) -> bool {
        self.blocks.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
