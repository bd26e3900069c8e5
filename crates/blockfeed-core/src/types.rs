//! Shared types for the sync pipeline.

use serde::{Deserialize, Serialize};

use crate::config::Network;
use crate::state::SyncPhase;
use crate::store::MaterializedStore;
use crate::upstream::UpstreamBlock;

// ─── ProcessedBlock ───────────────────────────────────────────────────────────

/// A block whose messages have been fully applied to the views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedBlock {
    pub block_index: u64,
    pub block_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub block_time: i64,
}

impl ProcessedBlock {
    /// Returns `true` if `self` directly follows `parent`.
    pub fn follows(&self, parent: &ProcessedBlock) -> bool {
        self.block_index == parent.block_index + 1
    }
}

impl From<&UpstreamBlock> for ProcessedBlock {
    fn from(block: &UpstreamBlock) -> Self {
        Self {
            block_index: block.block_index,
            block_hash: block.block_hash.clone(),
            block_time: block.block_time,
        }
    }
}

// ─── IndexContext ─────────────────────────────────────────────────────────────

/// Context passed to message and block processors while a block is applied.
pub struct IndexContext<'a> {
    /// The block being applied (not yet committed).
    pub block: &'a ProcessedBlock,
    pub phase: SyncPhase,
    pub network: Network,
    pub store: &'a dyn MaterializedStore,
}

/// Context passed to mempool processors.
pub struct MempoolContext<'a> {
    /// Local tip at the time the mempool was refreshed.
    pub tip: u64,
    pub network: Network,
    pub store: &'a dyn MaterializedStore,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_parent() {
        let parent = ProcessedBlock {
            block_index: 100,
            block_hash: "aa".into(),
            block_time: 1000,
        };
        let child = ProcessedBlock {
            block_index: 101,
            block_hash: "bb".into(),
            block_time: 1600,
        };
        let gap = ProcessedBlock {
            block_index: 102,
            ..child.clone()
        };
        assert!(child.follows(&parent));
        assert!(!parent.follows(&child));
        assert!(!gap.follows(&parent));
    }
}
