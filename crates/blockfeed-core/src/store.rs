//! The materialized store: persistence over named collections.
//!
//! Implementations include `InMemoryStore` and `SqliteStore` in
//! `blockfeed-storage`. The store is single-writer: only the sync loop (and
//! the processors it drives) mutate it; everyone else reads.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::asset::TrackedAsset;
use crate::error::FeedError;
use crate::model::{AppConfig, BalanceChange, MempoolEntry, Trade, TransactionStat};
use crate::types::ProcessedBlock;

/// Named collections held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    ProcessedBlocks,
    AppConfig,
    TrackedAssets,
    BalanceChanges,
    Trades,
    TransactionStats,
    Mempool,
    ModuleSettings,
}

impl Collection {
    /// Collections dropped on a full reparse.
    pub const PURGEABLE: [Collection; 7] = [
        Collection::ProcessedBlocks,
        Collection::AppConfig,
        Collection::TrackedAssets,
        Collection::BalanceChanges,
        Collection::Trades,
        Collection::TransactionStats,
        Collection::Mempool,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ProcessedBlocks => "processed_blocks",
            Self::AppConfig => "app_config",
            Self::TrackedAssets => "tracked_assets",
            Self::BalanceChanges => "balance_changes",
            Self::Trades => "trades",
            Self::TransactionStats => "transaction_stats",
            Self::Mempool => "mempool",
            Self::ModuleSettings => "module_settings",
        }
    }

    pub fn is_purgeable(self) -> bool {
        self != Self::ModuleSettings
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Persistence for every materialized view.
#[async_trait]
pub trait MaterializedStore: Send + Sync {
    // ── processed_blocks ──────────────────────────────────────────────────────

    async fn latest_processed_block(&self) -> Result<Option<ProcessedBlock>, FeedError>;

    async fn processed_block(&self, block_index: u64) -> Result<Option<ProcessedBlock>, FeedError>;

    /// Highest processed block with `block_index <= at_or_below`.
    async fn latest_processed_block_at_or_below(
        &self,
        at_or_below: u64,
    ) -> Result<Option<ProcessedBlock>, FeedError>;

    /// Commit a block. Fails unless it directly follows the latest processed
    /// block (or the collection is empty).
    async fn insert_processed_block(&self, block: &ProcessedBlock) -> Result<(), FeedError>;

    /// Delete rows with `block_index > block_index`; returns how many went.
    async fn delete_processed_blocks_after(&self, block_index: u64) -> Result<u64, FeedError>;

    /// All processed blocks, ascending.
    async fn processed_blocks(&self) -> Result<Vec<ProcessedBlock>, FeedError>;

    // ── app_config ────────────────────────────────────────────────────────────

    async fn load_app_config(&self) -> Result<Option<AppConfig>, FeedError>;

    async fn save_app_config(&self, config: &AppConfig) -> Result<(), FeedError>;

    // ── tracked_assets ────────────────────────────────────────────────────────

    async fn tracked_asset(&self, asset: &str) -> Result<Option<TrackedAsset>, FeedError>;

    /// Upsert by asset name.
    async fn save_tracked_asset(&self, asset: &TrackedAsset) -> Result<(), FeedError>;

    async fn delete_tracked_asset(&self, asset: &str) -> Result<(), FeedError>;

    /// Assets whose current snapshot was taken after `block_index`.
    async fn tracked_assets_changed_after(
        &self,
        block_index: u64,
    ) -> Result<Vec<TrackedAsset>, FeedError>;

    /// All tracked assets, ordered by name.
    async fn tracked_assets(&self) -> Result<Vec<TrackedAsset>, FeedError>;

    // ── balance_changes ───────────────────────────────────────────────────────

    async fn balance_change(
        &self,
        address: &str,
        asset: &str,
        block_index: u64,
    ) -> Result<Option<BalanceChange>, FeedError>;

    /// The most recent change for the pair, at any block.
    async fn latest_balance_change(
        &self,
        address: &str,
        asset: &str,
    ) -> Result<Option<BalanceChange>, FeedError>;

    /// Upsert by (address, asset, block_index).
    async fn save_balance_change(&self, change: &BalanceChange) -> Result<(), FeedError>;

    /// Every change for the pair, ascending by block.
    async fn balance_changes(
        &self,
        address: &str,
        asset: &str,
    ) -> Result<Vec<BalanceChange>, FeedError>;

    async fn delete_balance_changes_after(&self, block_index: u64) -> Result<u64, FeedError>;

    // ── trades ────────────────────────────────────────────────────────────────

    /// Upsert by order_match_id.
    async fn save_trade(&self, trade: &Trade) -> Result<(), FeedError>;

    /// All trades ordered by (block_index, message_index).
    async fn trades(&self) -> Result<Vec<Trade>, FeedError>;

    async fn delete_trades_after(&self, block_index: u64) -> Result<u64, FeedError>;

    // ── transaction_stats ─────────────────────────────────────────────────────

    async fn increment_transaction_stat(
        &self,
        block_index: u64,
        block_time: i64,
        category: &str,
    ) -> Result<(), FeedError>;

    async fn transaction_stats(&self, block_index: u64) -> Result<Vec<TransactionStat>, FeedError>;

    async fn delete_transaction_stats_after(&self, block_index: u64) -> Result<u64, FeedError>;

    // ── mempool ───────────────────────────────────────────────────────────────

    async fn mempool_entry(&self, tx_hash: &str) -> Result<Option<MempoolEntry>, FeedError>;

    /// Insert unless already present; returns `true` if inserted.
    async fn insert_mempool_entry(&self, entry: &MempoolEntry) -> Result<bool, FeedError>;

    async fn remove_mempool_entry(&self, tx_hash: &str) -> Result<bool, FeedError>;

    /// Drop entries first seen before `seen_before_block`.
    async fn prune_mempool(&self, seen_before_block: u64) -> Result<u64, FeedError>;

    async fn mempool(&self) -> Result<Vec<MempoolEntry>, FeedError>;

    // ── module_settings ───────────────────────────────────────────────────────

    async fn module_settings(&self) -> Result<BTreeMap<String, bool>, FeedError>;

    async fn set_module_enabled(&self, name: &str, enabled: bool) -> Result<(), FeedError>;

    // ── maintenance ───────────────────────────────────────────────────────────

    /// Drop every document in `collection`.
    async fn purge(&self, collection: Collection) -> Result<(), FeedError>;
}
