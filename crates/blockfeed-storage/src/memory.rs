//! In-memory materialized store.
//!
//! Holds every collection in RAM behind one mutex. Useful for tests and
//! throwaway followers that rebuild from genesis on every start.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use blockfeed_core::asset::TrackedAsset;
use blockfeed_core::error::FeedError;
use blockfeed_core::model::{AppConfig, BalanceChange, MempoolEntry, Trade, TransactionStat};
use blockfeed_core::store::{Collection, MaterializedStore};
use blockfeed_core::types::ProcessedBlock;

#[derive(Default)]
struct Collections {
    processed_blocks: BTreeMap<u64, ProcessedBlock>,
    app_config: Option<AppConfig>,
    tracked_assets: BTreeMap<String, TrackedAsset>,
    /// Keyed by (address, asset, block_index).
    balance_changes: BTreeMap<(String, String, u64), BalanceChange>,
    trades: BTreeMap<String, Trade>,
    /// Keyed by (block_index, category).
    transaction_stats: BTreeMap<(u64, String), TransactionStat>,
    mempool: BTreeMap<String, MempoolEntry>,
    module_settings: BTreeMap<String, bool>,
}

/// In-memory store. All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Collections>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Collections>, FeedError> {
        self.inner
            .lock()
            .map_err(|_| FeedError::Storage("in-memory store lock poisoned".into()))
    }
}

fn count_removed(before: usize, after: usize) -> u64 {
    (before - after) as u64
}

#[async_trait]
impl MaterializedStore for InMemoryStore {
    async fn latest_processed_block(&self) -> Result<Option<ProcessedBlock>, FeedError> {
        Ok(self.lock()?.processed_blocks.values().next_back().cloned())
    }

    async fn processed_block(&self, block_index: u64) -> Result<Option<ProcessedBlock>, FeedError> {
        Ok(self.lock()?.processed_blocks.get(&block_index).cloned())
    }

    async fn latest_processed_block_at_or_below(
        &self,
        at_or_below: u64,
    ) -> Result<Option<ProcessedBlock>, FeedError> {
        Ok(self
            .lock()?
            .processed_blocks
            .range(..=at_or_below)
            .next_back()
            .map(|(_, b)| b.clone()))
    }

    async fn insert_processed_block(&self, block: &ProcessedBlock) -> Result<(), FeedError> {
        let mut inner = self.lock()?;
        if let Some((_, latest)) = inner.processed_blocks.iter().next_back() {
            if !block.follows(latest) {
                return Err(FeedError::Storage(format!(
                    "block {} does not follow latest processed block {}",
                    block.block_index, latest.block_index
                )));
            }
        }
        inner.processed_blocks.insert(block.block_index, block.clone());
        Ok(())
    }

    async fn delete_processed_blocks_after(&self, block_index: u64) -> Result<u64, FeedError> {
        let mut inner = self.lock()?;
        let before = inner.processed_blocks.len();
        inner.processed_blocks.retain(|i, _| *i <= block_index);
        Ok(count_removed(before, inner.processed_blocks.len()))
    }

    async fn processed_blocks(&self) -> Result<Vec<ProcessedBlock>, FeedError> {
        Ok(self.lock()?.processed_blocks.values().cloned().collect())
    }

    async fn load_app_config(&self) -> Result<Option<AppConfig>, FeedError> {
        Ok(self.lock()?.app_config.clone())
    }

    async fn save_app_config(&self, config: &AppConfig) -> Result<(), FeedError> {
        self.lock()?.app_config = Some(config.clone());
        Ok(())
    }

    async fn tracked_asset(&self, asset: &str) -> Result<Option<TrackedAsset>, FeedError> {
        Ok(self.lock()?.tracked_assets.get(asset).cloned())
    }

    async fn save_tracked_asset(&self, asset: &TrackedAsset) -> Result<(), FeedError> {
        self.lock()?
            .tracked_assets
            .insert(asset.asset.clone(), asset.clone());
        Ok(())
    }

    async fn delete_tracked_asset(&self, asset: &str) -> Result<(), FeedError> {
        self.lock()?.tracked_assets.remove(asset);
        Ok(())
    }

    async fn tracked_assets_changed_after(
        &self,
        block_index: u64,
    ) -> Result<Vec<TrackedAsset>, FeedError> {
        Ok(self
            .lock()?
            .tracked_assets
            .values()
            .filter(|a| a.at_block() > block_index)
            .cloned()
            .collect())
    }

    async fn tracked_assets(&self) -> Result<Vec<TrackedAsset>, FeedError> {
        Ok(self.lock()?.tracked_assets.values().cloned().collect())
    }

    async fn balance_change(
        &self,
        address: &str,
        asset: &str,
        block_index: u64,
    ) -> Result<Option<BalanceChange>, FeedError> {
        let key = (address.to_string(), asset.to_string(), block_index);
        Ok(self.lock()?.balance_changes.get(&key).cloned())
    }

    async fn latest_balance_change(
        &self,
        address: &str,
        asset: &str,
    ) -> Result<Option<BalanceChange>, FeedError> {
        let lo = (address.to_string(), asset.to_string(), 0);
        let hi = (address.to_string(), asset.to_string(), u64::MAX);
        Ok(self
            .lock()?
            .balance_changes
            .range(lo..=hi)
            .next_back()
            .map(|(_, c)| c.clone()))
    }

    async fn save_balance_change(&self, change: &BalanceChange) -> Result<(), FeedError> {
        let key = (change.address.clone(), change.asset.clone(), change.block_index);
        self.lock()?.balance_changes.insert(key, change.clone());
        Ok(())
    }

    async fn balance_changes(
        &self,
        address: &str,
        asset: &str,
    ) -> Result<Vec<BalanceChange>, FeedError> {
        let lo = (address.to_string(), asset.to_string(), 0);
        let hi = (address.to_string(), asset.to_string(), u64::MAX);
        Ok(self
            .lock()?
            .balance_changes
            .range(lo..=hi)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn delete_balance_changes_after(&self, block_index: u64) -> Result<u64, FeedError> {
        let mut inner = self.lock()?;
        let before = inner.balance_changes.len();
        inner.balance_changes.retain(|_, c| c.block_index <= block_index);
        Ok(count_removed(before, inner.balance_changes.len()))
    }

    async fn save_trade(&self, trade: &Trade) -> Result<(), FeedError> {
        self.lock()?
            .trades
            .insert(trade.order_match_id.clone(), trade.clone());
        Ok(())
    }

    async fn trades(&self) -> Result<Vec<Trade>, FeedError> {
        let mut trades: Vec<Trade> = self.lock()?.trades.values().cloned().collect();
        trades.sort_by_key(|t| (t.block_index, t.message_index));
        Ok(trades)
    }

    async fn delete_trades_after(&self, block_index: u64) -> Result<u64, FeedError> {
        let mut inner = self.lock()?;
        let before = inner.trades.len();
        inner.trades.retain(|_, t| t.block_index <= block_index);
        Ok(count_removed(before, inner.trades.len()))
    }

    async fn increment_transaction_stat(
        &self,
        block_index: u64,
        block_time: i64,
        category: &str,
    ) -> Result<(), FeedError> {
        self.lock()?
            .transaction_stats
            .entry((block_index, category.to_string()))
            .or_insert_with(|| TransactionStat {
                block_index,
                block_time,
                category: category.to_string(),
                count: 0,
            })
            .count += 1;
        Ok(())
    }

    async fn transaction_stats(&self, block_index: u64) -> Result<Vec<TransactionStat>, FeedError> {
        Ok(self
            .lock()?
            .transaction_stats
            .range((block_index, String::new())..(block_index + 1, String::new()))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn delete_transaction_stats_after(&self, block_index: u64) -> Result<u64, FeedError> {
        let mut inner = self.lock()?;
        let before = inner.transaction_stats.len();
        inner.transaction_stats.retain(|(i, _), _| *i <= block_index);
        Ok(count_removed(before, inner.transaction_stats.len()))
    }

    async fn mempool_entry(&self, tx_hash: &str) -> Result<Option<MempoolEntry>, FeedError> {
        Ok(self.lock()?.mempool.get(tx_hash).cloned())
    }

    async fn insert_mempool_entry(&self, entry: &MempoolEntry) -> Result<bool, FeedError> {
        let mut inner = self.lock()?;
        if inner.mempool.contains_key(&entry.tx_hash) {
            return Ok(false);
        }
        inner.mempool.insert(entry.tx_hash.clone(), entry.clone());
        Ok(true)
    }

    async fn remove_mempool_entry(&self, tx_hash: &str) -> Result<bool, FeedError> {
        Ok(self.lock()?.mempool.remove(tx_hash).is_some())
    }

    async fn prune_mempool(&self, seen_before_block: u64) -> Result<u64, FeedError> {
        let mut inner = self.lock()?;
        let before = inner.mempool.len();
        inner.mempool.retain(|_, e| e.seen_at_block >= seen_before_block);
        Ok(count_removed(before, inner.mempool.len()))
    }

    async fn mempool(&self) -> Result<Vec<MempoolEntry>, FeedError> {
        let mut entries: Vec<MempoolEntry> = self.lock()?.mempool.values().cloned().collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.tx_hash.cmp(&b.tx_hash)));
        Ok(entries)
    }

    async fn module_settings(&self) -> Result<BTreeMap<String, bool>, FeedError> {
        Ok(self.lock()?.module_settings.clone())
    }

    async fn set_module_enabled(&self, name: &str, enabled: bool) -> Result<(), FeedError> {
        self.lock()?.module_settings.insert(name.to_string(), enabled);
        Ok(())
    }

    async fn purge(&self, collection: Collection) -> Result<(), FeedError> {
        let mut inner = self.lock()?;
        match collection {
            Collection::ProcessedBlocks => inner.processed_blocks.clear(),
            Collection::AppConfig => inner.app_config = None,
            Collection::TrackedAssets => inner.tracked_assets.clear(),
            Collection::BalanceChanges => inner.balance_changes.clear(),
            Collection::Trades => inner.trades.clear(),
            Collection::TransactionStats => inner.transaction_stats.clear(),
            Collection::Mempool => inner.mempool.clear(),
            Collection::ModuleSettings => inner.module_settings.clear(),
        }
        tracing::debug!(%collection, "purged collection");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
