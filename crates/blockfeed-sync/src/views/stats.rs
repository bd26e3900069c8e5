//! Per-block counts of protocol transactions by category.

use async_trait::async_trait;
use serde_json::Value;

use blockfeed_core::error::FeedError;
use blockfeed_core::handler::{ControlSignal, MessageProcessor, RollbackProcessor};
use blockfeed_core::reorg::RollbackTarget;
use blockfeed_core::store::{Collection, MaterializedStore};
use blockfeed_core::types::IndexContext;
use blockfeed_core::upstream::Message;

use super::is_insert;

/// Categories that correspond to user transactions.
pub const TRANSACTION_CATEGORIES: &[&str] = &[
    "bets",
    "broadcasts",
    "btcpays",
    "burns",
    "cancels",
    "destructions",
    "dispensers",
    "dividends",
    "issuances",
    "orders",
    "sends",
    "sweeps",
];

pub struct TransactionStats;

#[async_trait]
impl MessageProcessor for TransactionStats {
    async fn process(
        &self,
        msg: &Message,
        _data: &Value,
        ctx: &IndexContext<'_>,
    ) -> Result<ControlSignal, FeedError> {
        if is_insert(&msg.command) && TRANSACTION_CATEGORIES.contains(&msg.category.as_str()) {
            ctx.store
                .increment_transaction_stat(ctx.block.block_index, ctx.block.block_time, &msg.category)
                .await?;
        }
        Ok(ControlSignal::Continue)
    }
}

#[async_trait]
impl RollbackProcessor for TransactionStats {
    async fn rollback(
        &self,
        target: RollbackTarget,
        store: &dyn MaterializedStore,
    ) -> Result<(), FeedError> {
        match target {
            RollbackTarget::FullWipe => store.purge(Collection::TransactionStats).await,
            RollbackTarget::Block(block_index) => {
                store.delete_transaction_stats_after(block_index).await.map(|_| ())
            }
        }
    }
}
