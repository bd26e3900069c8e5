//! Completed order matches booked as base/quote trades.

use async_trait::async_trait;
use serde_json::Value;

use blockfeed_core::error::FeedError;
use blockfeed_core::handler::{ControlSignal, MessageProcessor, RollbackProcessor};
use blockfeed_core::model::Trade;
use blockfeed_core::reorg::RollbackTarget;
use blockfeed_core::store::{Collection, MaterializedStore};
use blockfeed_core::types::IndexContext;
use blockfeed_core::upstream::Message;

use super::{i64_field, is_insert, str_field};

const UNIT: f64 = 100_000_000.0;

pub struct TradeBook {
    /// Assets preferred as the quote side, strongest first.
    quote_assets: Vec<String>,
}

impl Default for TradeBook {
    fn default() -> Self {
        Self::new(vec!["BTC".into(), "XCP".into()])
    }
}

impl TradeBook {
    pub fn new(quote_assets: Vec<String>) -> Self {
        Self { quote_assets }
    }

    /// Order a pair as (base, quote).
    ///
    /// A listed quote asset beats an unlisted one, and an earlier entry beats
    /// a later one. Two unlisted assets are quoted in the lexically smaller one.
    pub fn base_quote<'a>(&self, a: &'a str, b: &'a str) -> (&'a str, &'a str) {
        let rank = |asset: &str| self.quote_assets.iter().position(|q| q == asset);
        match (rank(a), rank(b)) {
            (Some(ra), Some(rb)) if ra < rb => (b, a),
            (Some(_), Some(_)) => (a, b),
            (Some(_), None) => (b, a),
            (None, Some(_)) => (a, b),
            (None, None) if a < b => (b, a),
            (None, None) => (a, b),
        }
    }
}

async fn normalize(store: &dyn MaterializedStore, asset: &str, quantity: i64) -> Result<f64, FeedError> {
    let divisible = match store.tracked_asset(asset).await? {
        Some(tracked) => tracked.current().divisible,
        None => {
            tracing::warn!(%asset, "trade in untracked asset, assuming divisible");
            true
        }
    };
    Ok(if divisible {
        quantity as f64 / UNIT
    } else {
        quantity as f64
    })
}

#[async_trait]
impl MessageProcessor for TradeBook {
    async fn process(
        &self,
        msg: &Message,
        data: &Value,
        ctx: &IndexContext<'_>,
    ) -> Result<ControlSignal, FeedError> {
        if msg.category != "order_matches" || !is_insert(&msg.command) {
            return Ok(ControlSignal::Continue);
        }
        // Matches paid in BTC settle later through btcpays and are not booked.
        if data.get("status").and_then(Value::as_str) != Some("completed") {
            return Ok(ControlSignal::Continue);
        }

        let forward_asset = str_field(data, "forward_asset")?;
        let backward_asset = str_field(data, "backward_asset")?;
        let forward_quantity = i64_field(data, "forward_quantity")?;
        let backward_quantity = i64_field(data, "backward_quantity")?;

        let (base_asset, quote_asset) = self.base_quote(forward_asset, backward_asset);
        let (base_quantity, quote_quantity) = if base_asset == forward_asset {
            (forward_quantity, backward_quantity)
        } else {
            (backward_quantity, forward_quantity)
        };

        let base_quantity_normalized = normalize(ctx.store, base_asset, base_quantity).await?;
        let quote_quantity_normalized = normalize(ctx.store, quote_asset, quote_quantity).await?;
        let unit_price = if base_quantity_normalized == 0.0 {
            0.0
        } else {
            quote_quantity_normalized / base_quantity_normalized
        };

        let trade = Trade {
            order_match_id: str_field(data, "id")?.to_string(),
            block_index: ctx.block.block_index,
            block_time: ctx.block.block_time,
            message_index: msg.message_index,
            order_match_tx0_hash: str_field(data, "tx0_hash")?.to_string(),
            order_match_tx1_hash: str_field(data, "tx1_hash")?.to_string(),
            order_match_tx0_address: str_field(data, "tx0_address")?.to_string(),
            order_match_tx1_address: str_field(data, "tx1_address")?.to_string(),
            base_asset: base_asset.to_string(),
            quote_asset: quote_asset.to_string(),
            base_quantity,
            quote_quantity,
            base_quantity_normalized,
            quote_quantity_normalized,
            unit_price,
        };
        tracing::debug!(
            id = %trade.order_match_id,
            pair = %format!("{base_asset}/{quote_asset}"),
            unit_price,
            "trade booked"
        );
        ctx.store.save_trade(&trade).await?;
        Ok(ControlSignal::Continue)
    }
}

#[async_trait]
impl RollbackProcessor for TradeBook {
    async fn rollback(
        &self,
        target: RollbackTarget,
        store: &dyn MaterializedStore,
    ) -> Result<(), FeedError> {
        match target {
            RollbackTarget::FullWipe => store.purge(Collection::Trades).await,
            RollbackTarget::Block(block_index) => store.delete_trades_after(block_index).await.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_priority() {
        let book = TradeBook::default();
        assert_eq!(book.base_quote("XCP", "BTC"), ("XCP", "BTC"));
        assert_eq!(book.base_quote("BTC", "XCP"), ("XCP", "BTC"));
        assert_eq!(book.base_quote("GOLD", "XCP"), ("GOLD", "XCP"));
        assert_eq!(book.base_quote("XCP", "GOLD"), ("GOLD", "XCP"));
        assert_eq!(book.base_quote("SILVER", "GOLD"), ("SILVER", "GOLD"));
        assert_eq!(book.base_quote("GOLD", "SILVER"), ("SILVER", "GOLD"));
    }
}
