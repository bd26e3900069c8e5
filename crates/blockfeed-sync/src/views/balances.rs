//! Per-block balance changes from credit and debit messages.

use async_trait::async_trait;
use serde_json::Value;

use blockfeed_core::error::FeedError;
use blockfeed_core::handler::{ControlSignal, MessageProcessor, RollbackProcessor};
use blockfeed_core::model::BalanceChange;
use blockfeed_core::reorg::RollbackTarget;
use blockfeed_core::store::{Collection, MaterializedStore};
use blockfeed_core::types::IndexContext;
use blockfeed_core::upstream::Message;

use super::{i64_field, is_insert, str_field};

/// One `BalanceChange` per (address, asset, block); repeated movements
/// within a block accumulate into the same document.
pub struct BalanceTracker;

fn overflow(address: &str, asset: &str) -> FeedError {
    FeedError::Other(format!("balance overflow for {address}/{asset}"))
}

/// Fold `delta` into the block's document for the pair.
pub async fn apply_delta(
    store: &dyn MaterializedStore,
    address: &str,
    asset: &str,
    block_index: u64,
    block_time: i64,
    delta: i64,
) -> Result<BalanceChange, FeedError> {
    let change = match store.balance_change(address, asset, block_index).await? {
        Some(mut existing) => {
            existing.quantity = existing.quantity.checked_add(delta).ok_or_else(|| overflow(address, asset))?;
            existing.new_balance = existing
                .new_balance
                .checked_add(delta)
                .ok_or_else(|| overflow(address, asset))?;
            existing
        }
        None => {
            let previous = store
                .latest_balance_change(address, asset)
                .await?
                .map_or(0, |c| c.new_balance);
            BalanceChange {
                address: address.to_string(),
                asset: asset.to_string(),
                block_index,
                block_time,
                quantity: delta,
                new_balance: previous.checked_add(delta).ok_or_else(|| overflow(address, asset))?,
            }
        }
    };
    store.save_balance_change(&change).await?;
    Ok(change)
}

#[async_trait]
impl MessageProcessor for BalanceTracker {
    async fn process(
        &self,
        msg: &Message,
        data: &Value,
        ctx: &IndexContext<'_>,
    ) -> Result<ControlSignal, FeedError> {
        if !is_insert(&msg.command) {
            return Ok(ControlSignal::Continue);
        }
        let sign = match msg.category.as_str() {
            "credits" => 1,
            "debits" => -1,
            _ => return Ok(ControlSignal::Continue),
        };

        let address = str_field(data, "address")?;
        let asset = str_field(data, "asset")?;
        let quantity = i64_field(data, "quantity")?;
        apply_delta(
            ctx.store,
            address,
            asset,
            ctx.block.block_index,
            ctx.block.block_time,
            sign * quantity,
        )
        .await?;
        Ok(ControlSignal::Continue)
    }
}

#[async_trait]
impl RollbackProcessor for BalanceTracker {
    async fn rollback(
        &self,
        target: RollbackTarget,
        store: &dyn MaterializedStore,
    ) -> Result<(), FeedError> {
        match target {
            RollbackTarget::FullWipe => store.purge(Collection::BalanceChanges).await,
            RollbackTarget::Block(block_index) => {
                store.delete_balance_changes_after(block_index).await.map(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockfeed_storage::InMemoryStore;

    #[tokio::test]
    async fn same_block_movements_accumulate() {
        let store = InMemoryStore::new();
        apply_delta(&store, "alice", "XCP", 5, 0, 100).await.unwrap();
        apply_delta(&store, "alice", "XCP", 6, 0, 50).await.unwrap();
        apply_delta(&store, "alice", "XCP", 6, 0, -20).await.unwrap();

        let changes = store.balance_changes("alice", "XCP").await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].quantity, 30);
        assert_eq!(changes[1].new_balance, 130);
    }

    #[tokio::test]
    async fn rollback_hook_deletes_after_target() {
        let store = InMemoryStore::new();
        apply_delta(&store, "bob", "XCP", 5, 0, 10).await.unwrap();
        apply_delta(&store, "bob", "XCP", 9, 0, 10).await.unwrap();

        BalanceTracker.rollback(RollbackTarget::Block(5), &store).await.unwrap();
        let latest = store.latest_balance_change("bob", "XCP").await.unwrap().unwrap();
        assert_eq!(latest.block_index, 5);

        BalanceTracker.rollback(RollbackTarget::FullWipe, &store).await.unwrap();
        assert!(store.balance_changes("bob", "XCP").await.unwrap().is_empty());
    }
}
