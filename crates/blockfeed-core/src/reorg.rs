//! Rollback targets and the triggers that lead to them.
//!
//! Three situations roll the views back:
//! 1. **Reorg message**: the upstream names a block X; roll back to X−1
//! 2. **Ahead of upstream**: local checkpoint above the upstream tip; roll back by a safety margin
//! 3. **Block failure**: a block failed mid-apply; roll back to the last committed block
//!
//! plus the startup defensive rollback and the operator-issued one.

use serde::{Deserialize, Serialize};

/// Where a rollback goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackTarget {
    /// Keep everything up to and including this block.
    Block(u64),
    /// Drop everything and reseed from genesis.
    FullWipe,
}

impl RollbackTarget {
    /// Whether a row stamped `block_index` survives this rollback.
    pub fn keeps(self, block_index: u64) -> bool {
        match self {
            Self::Block(target) => block_index <= target,
            Self::FullWipe => false,
        }
    }
}

impl std::fmt::Display for RollbackTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block(i) => write!(f, "block {i}"),
            Self::FullWipe => write!(f, "full wipe"),
        }
    }
}

/// Why a rollback happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackTrigger {
    /// Upstream emitted a reorg message naming this block.
    ReorgMessage { reorg_block: u64 },
    /// Local checkpoint was above the upstream tip.
    AheadOfUpstream { upstream_tip: u64 },
    /// A block failed to apply.
    BlockFailure { block_index: u64 },
    /// Defensive rollback of the last checkpoint at startup.
    Startup,
    /// Schema, network or upstream version drift.
    Reparse,
    /// Requested by an operator.
    Manual,
}

impl std::fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReorgMessage { reorg_block } => write!(f, "reorg message at block {reorg_block}"),
            Self::AheadOfUpstream { upstream_tip } => {
                write!(f, "ahead of upstream tip {upstream_tip}")
            }
            Self::BlockFailure { block_index } => write!(f, "failure applying block {block_index}"),
            Self::Startup => write!(f, "startup"),
            Self::Reparse => write!(f, "reparse"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Outcome of a rollback, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub target: RollbackTarget,
    pub trigger: RollbackTrigger,
    pub blocks_removed: u64,
    pub assets_restored: u64,
    pub assets_deleted: u64,
}
