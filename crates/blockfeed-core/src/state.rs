//! Process-wide sync state and the read-only snapshots exposed to readers.
//!
//! `SyncState` is owned by the sync loop and lent `&mut` to the reorg engine;
//! nothing else mutates it. Readers get [`SyncSnapshot`]s over a watch channel.

use serde::{Deserialize, Serialize};

use crate::types::ProcessedBlock;

/// Where the sync loop is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Not yet started.
    Uninitialized,
    /// Wiping views after version/network drift and restarting from genesis.
    Resyncing,
    /// Behind the upstream tip, applying blocks.
    CatchingUp { autopilot: bool },
    /// At the upstream tip, but the upstream itself is not caught up.
    NearTip,
    /// At the tip of an upstream that is caught up to its backend.
    CaughtUp,
}

impl SyncPhase {
    /// Whether the read surface should report "not caught up".
    pub fn is_syncing(self) -> bool {
        !matches!(self, Self::CaughtUp)
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Resyncing => write!(f, "resyncing"),
            Self::CatchingUp { autopilot: true } => write!(f, "catching-up (autopilot)"),
            Self::CatchingUp { autopilot: false } => write!(f, "catching-up"),
            Self::NearTip => write!(f, "near-tip"),
            Self::CaughtUp => write!(f, "caught-up"),
        }
    }
}

/// Mutable sync state.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub phase: SyncPhase,
    /// Block currently being applied.
    pub cur_block: Option<ProcessedBlock>,
    /// Last committed block; `None` at the genesis checkpoint.
    pub my_latest_block: Option<ProcessedBlock>,
    /// Index of the last applied message; `-1` when unknown.
    pub last_message_index: i64,
    pub cp_latest_block_index: u64,
    pub cp_backend_block_index: Option<u64>,
    /// Upstream's own "caught up to its backend" flag.
    pub cp_caught_up: bool,
    pub caught_up: bool,
    /// Set once the caught-up hooks have run; never cleared.
    pub caught_up_started_events: bool,
    /// Block index used when nothing is committed.
    genesis_block: u64,
}

impl SyncState {
    pub fn new(genesis_block: u64) -> Self {
        Self {
            phase: SyncPhase::Uninitialized,
            cur_block: None,
            my_latest_block: None,
            last_message_index: -1,
            cp_latest_block_index: 0,
            cp_backend_block_index: None,
            cp_caught_up: false,
            caught_up: false,
            caught_up_started_events: false,
            genesis_block,
        }
    }

    /// The local checkpoint: last committed block, or the genesis checkpoint.
    pub fn local_block_index(&self) -> u64 {
        self.my_latest_block
            .as_ref()
            .map(|b| b.block_index)
            .unwrap_or(self.genesis_block)
    }

    pub fn genesis_block(&self) -> u64 {
        self.genesis_block
    }

    pub fn next_block_index(&self) -> u64 {
        self.local_block_index() + 1
    }

    /// Reset after a rollback to `latest` (`None` = full wipe).
    pub fn rolled_back_to(&mut self, latest: Option<ProcessedBlock>) {
        self.my_latest_block = latest;
        self.cur_block = None;
        self.last_message_index = -1;
        self.caught_up = false;
    }

    /// `min_message_index` to request from upstream, if known.
    pub fn min_message_index(&self) -> Option<i64> {
        (self.last_message_index >= 0).then_some(self.last_message_index + 1)
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            phase: self.phase,
            local_block_index: self.local_block_index(),
            upstream_block_index: self.cp_latest_block_index,
            upstream_backend_block_index: self.cp_backend_block_index,
            last_message_index: self.last_message_index,
            caught_up: self.caught_up,
        }
    }
}

/// Read-only view of [`SyncState`] for concurrent readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub phase: SyncPhase,
    pub local_block_index: u64,
    pub upstream_block_index: u64,
    pub upstream_backend_block_index: Option<u64>,
    pub last_message_index: i64,
    pub caught_up: bool,
}

impl SyncSnapshot {
    pub fn initial(genesis_block: u64) -> Self {
        SyncState::new(genesis_block).snapshot()
    }

    /// Blocks remaining until the upstream tip.
    pub fn blocks_behind(&self) -> u64 {
        self.upstream_block_index.saturating_sub(self.local_block_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(i: u64) -> ProcessedBlock {
        ProcessedBlock {
            block_index: i,
            block_hash: format!("{i:064x}"),
            block_time: i as i64,
        }
    }

    #[test]
    fn local_index_falls_back_to_genesis() {
        let mut state = SyncState::new(99);
        assert_eq!(state.local_block_index(), 99);
        assert_eq!(state.next_block_index(), 100);
        state.my_latest_block = Some(block(120));
        assert_eq!(state.next_block_index(), 121);
    }

    #[test]
    fn rollback_resets_message_index_and_caught_up() {
        let mut state = SyncState::new(0);
        state.last_message_index = 55;
        state.caught_up = true;
        state.caught_up_started_events = true;
        state.rolled_back_to(Some(block(7)));
        assert_eq!(state.last_message_index, -1);
        assert!(!state.caught_up);
        assert!(state.caught_up_started_events);
        assert_eq!(state.min_message_index(), None);
        assert_eq!(state.local_block_index(), 7);
    }

    #[test]
    fn snapshot_reports_distance() {
        let mut state = SyncState::new(0);
        state.my_latest_block = Some(block(40));
        state.cp_latest_block_index = 100;
        let snap = state.snapshot();
        assert_eq!(snap.blocks_behind(), 60);
        assert!(snap.phase.is_syncing());
    }
}
