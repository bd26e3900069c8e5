//! Tracked assets as an append-only snapshot log.
//!
//! Every mutating issuance appends a full snapshot; the newest snapshot is the
//! visible state and all earlier ones form the asset's history. Snapshots are
//! ordered by `at_block` (non-decreasing), so point-in-time reads and rollbacks
//! are a binary search plus a truncate.

use serde::{Deserialize, Serialize};

/// What changed when a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    IssuedMore,
    Locked,
    Transferred,
    ChangedDescription,
}

/// The state of an asset as of one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSnapshot {
    /// `None` for protocol-native assets.
    pub owner: Option<String>,
    pub description: String,
    pub divisible: bool,
    pub locked: bool,
    pub total_issued: i64,
    pub at_block: u64,
    pub at_block_time: i64,
    pub change_type: ChangeType,
}

/// An issued asset with its full snapshot log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAsset {
    pub asset: String,
    /// Oldest first; never empty.
    snapshots: Vec<AssetSnapshot>,
}

impl TrackedAsset {
    /// Start tracking an asset from its first snapshot.
    pub fn new(asset: impl Into<String>, first: AssetSnapshot) -> Self {
        Self {
            asset: asset.into(),
            snapshots: vec![first],
        }
    }

    /// Rebuild from persisted snapshots. Returns `None` for an empty or
    /// unordered log.
    pub fn from_snapshots(asset: impl Into<String>, snapshots: Vec<AssetSnapshot>) -> Option<Self> {
        if snapshots.is_empty() || snapshots.windows(2).any(|w| w[0].at_block > w[1].at_block) {
            return None;
        }
        Some(Self {
            asset: asset.into(),
            snapshots,
        })
    }

    /// The visible state.
    pub fn current(&self) -> &AssetSnapshot {
        // Invariant: the log is never empty.
        &self.snapshots[self.snapshots.len() - 1]
    }

    /// Prior snapshots, oldest first.
    pub fn history(&self) -> &[AssetSnapshot] {
        &self.snapshots[..self.snapshots.len() - 1]
    }

    pub fn snapshots(&self) -> &[AssetSnapshot] {
        &self.snapshots
    }

    pub fn at_block(&self) -> u64 {
        self.current().at_block
    }

    /// Append a new visible state derived from the current one.
    ///
    /// A snapshot older than the current one is clamped to the current block
    /// so `at_block` stays non-decreasing.
    pub fn push(&mut self, mut next: AssetSnapshot) {
        let floor = self.at_block();
        if next.at_block < floor {
            tracing::warn!(asset = %self.asset, at_block = next.at_block, floor, "snapshot out of order, clamping");
            next.at_block = floor;
        }
        self.snapshots.push(next);
    }

    /// The state visible as of `block_index`, if the asset existed then.
    pub fn as_of(&self, block_index: u64) -> Option<&AssetSnapshot> {
        let keep = self.snapshots.partition_point(|s| s.at_block <= block_index);
        keep.checked_sub(1).map(|i| &self.snapshots[i])
    }

    /// Drop every snapshot taken after `block_index`.
    ///
    /// Returns `false` when nothing remains, meaning the asset did not exist
    /// at that block and must be deleted.
    pub fn rollback_to(&mut self, block_index: u64) -> bool {
        let keep = self.snapshots.partition_point(|s| s.at_block <= block_index);
        self.snapshots.truncate(keep);
        !self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(at_block: u64, change_type: ChangeType, total: i64, locked: bool) -> AssetSnapshot {
        AssetSnapshot {
            owner: Some("1Owner".into()),
            description: "gold".into(),
            divisible: true,
            locked,
            total_issued: total,
            at_block,
            at_block_time: at_block as i64 * 600,
            change_type,
        }
    }

    fn gold() -> TrackedAsset {
        let mut asset = TrackedAsset::new("GOLD", snap(10, ChangeType::Created, 100, false));
        asset.push(snap(15, ChangeType::IssuedMore, 150, false));
        asset.push(snap(20, ChangeType::Locked, 150, true));
        asset
    }

    #[test]
    fn rollback_restores_prior_snapshot() {
        let mut asset = gold();
        assert_eq!(asset.history().len(), 2);

        assert!(asset.rollback_to(17));
        assert_eq!(asset.current().at_block, 15);
        assert_eq!(asset.current().total_issued, 150);
        assert!(!asset.current().locked);
        assert_eq!(asset.history().len(), 1);
        assert_eq!(asset.history()[0].at_block, 10);
    }

    #[test]
    fn rollback_before_creation_empties() {
        let mut asset = gold();
        assert!(!asset.rollback_to(9));
    }

    #[test]
    fn rollback_at_exact_block_keeps_it() {
        let mut asset = gold();
        assert!(asset.rollback_to(20));
        assert_eq!(asset.snapshots().len(), 3);
    }

    #[test]
    fn as_of_point_in_time() {
        let asset = gold();
        assert!(asset.as_of(9).is_none());
        assert_eq!(asset.as_of(10).unwrap().change_type, ChangeType::Created);
        assert_eq!(asset.as_of(19).unwrap().total_issued, 150);
        assert!(asset.as_of(1_000).unwrap().locked);
    }

    #[test]
    fn same_block_changes_roll_back_together() {
        let mut asset = TrackedAsset::new("SILVER", snap(10, ChangeType::Created, 1, false));
        asset.push(snap(12, ChangeType::IssuedMore, 2, false));
        asset.push(snap(12, ChangeType::IssuedMore, 3, false));
        assert!(asset.rollback_to(11));
        assert_eq!(asset.current().total_issued, 1);
        assert!(asset.history().is_empty());
    }

    #[test]
    fn from_snapshots_rejects_bad_logs() {
        assert!(TrackedAsset::from_snapshots("X", vec![]).is_none());
        let unordered = vec![
            snap(20, ChangeType::Created, 1, false),
            snap(10, ChangeType::IssuedMore, 2, false),
        ];
        assert!(TrackedAsset::from_snapshots("X", unordered).is_none());
    }
}
