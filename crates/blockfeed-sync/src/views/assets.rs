//! Tracked assets, built from issuance messages.
//!
//! The first issuance of an asset creates it; every later one appends a
//! snapshot to its log. Rollback of the log is done by the reorg engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use blockfeed_core::asset::{AssetSnapshot, ChangeType, TrackedAsset};
use blockfeed_core::error::FeedError;
use blockfeed_core::handler::{ControlSignal, MessageProcessor};
use blockfeed_core::types::IndexContext;
use blockfeed_core::upstream::Message;

use super::{bool_field, i64_field, is_insert, str_field};
use crate::workers::WorkerHandle;

/// Fetches off-chain metadata named by an asset description.
#[async_trait]
pub trait ExtendedInfoFetcher: Send + Sync {
    async fn fetch(&self, asset: &str, url: &str) -> Result<(), FeedError>;
}

#[derive(Default)]
pub struct AssetTracker {
    extended_info: Option<(WorkerHandle, Arc<dyn ExtendedInfoFetcher>)>,
}

impl AssetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extended_info(workers: WorkerHandle, fetcher: Arc<dyn ExtendedInfoFetcher>) -> Self {
        Self {
            extended_info: Some((workers, fetcher)),
        }
    }

    fn schedule_extended_info(&self, asset: &str, description: &str) {
        let Some((workers, fetcher)) = &self.extended_info else {
            return;
        };
        if !description.to_ascii_lowercase().ends_with(".json") {
            return;
        }
        let fetcher = Arc::clone(fetcher);
        let asset = asset.to_string();
        let url = description.to_string();
        workers.try_submit(async move {
            if let Err(e) = fetcher.fetch(&asset, &url).await {
                tracing::warn!(%asset, %url, error = %e, "extended info fetch failed");
            }
        });
    }
}

/// Derive the next snapshot of an existing asset from an issuance.
pub fn next_snapshot(
    current: &AssetSnapshot,
    data: &Value,
    at_block: u64,
    at_block_time: i64,
) -> Result<AssetSnapshot, FeedError> {
    let mut next = current.clone();
    next.at_block = at_block;
    next.at_block_time = at_block_time;

    let description = data.get("description").and_then(Value::as_str).unwrap_or_default();

    if bool_field(data, "transfer") {
        next.owner = Some(str_field(data, "issuer")?.to_string());
        next.change_type = ChangeType::Transferred;
    } else if bool_field(data, "locked") {
        next.locked = true;
        next.change_type = ChangeType::Locked;
    } else if description != current.description {
        next.description = description.to_string();
        next.change_type = ChangeType::ChangedDescription;
    } else {
        let quantity = i64_field(data, "quantity")?;
        next.total_issued = current
            .total_issued
            .checked_add(quantity)
            .ok_or_else(|| FeedError::Other(format!("total_issued overflow adding {quantity}")))?;
        next.change_type = ChangeType::IssuedMore;
    }
    Ok(next)
}

#[async_trait]
impl MessageProcessor for AssetTracker {
    async fn process(
        &self,
        msg: &Message,
        data: &Value,
        ctx: &IndexContext<'_>,
    ) -> Result<ControlSignal, FeedError> {
        if msg.category != "issuances" || !is_insert(&msg.command) {
            return Ok(ControlSignal::Continue);
        }

        let name = str_field(data, "asset")?;
        let block = ctx.block;
        let tracked = match ctx.store.tracked_asset(name).await? {
            None => {
                let first = AssetSnapshot {
                    owner: Some(str_field(data, "issuer")?.to_string()),
                    description: data
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    divisible: bool_field(data, "divisible"),
                    locked: bool_field(data, "locked"),
                    total_issued: i64_field(data, "quantity")?,
                    at_block: block.block_index,
                    at_block_time: block.block_time,
                    change_type: ChangeType::Created,
                };
                TrackedAsset::new(name, first)
            }
            Some(mut tracked) => {
                let next = next_snapshot(tracked.current(), data, block.block_index, block.block_time)?;
                tracked.push(next);
                tracked
            }
        };

        let current = tracked.current();
        if matches!(current.change_type, ChangeType::Created | ChangeType::ChangedDescription) {
            self.schedule_extended_info(name, &current.description);
        }
        tracing::debug!(
            asset = name,
            change = ?current.change_type,
            block_index = block.block_index,
            "asset updated"
        );
        ctx.store.save_tracked_asset(&tracked).await?;
        Ok(ControlSignal::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn current() -> AssetSnapshot {
        AssetSnapshot {
            owner: Some("1Alice".into()),
            description: "gold bars".into(),
            divisible: true,
            locked: false,
            total_issued: 1_000,
            at_block: 10,
            at_block_time: 6_000,
            change_type: ChangeType::Created,
        }
    }

    #[test]
    fn issuing_more_adds_quantity() {
        let data = json!({ "asset": "GOLD", "issuer": "1Alice", "quantity": 500, "description": "gold bars" });
        let next = next_snapshot(&current(), &data, 12, 7_200).unwrap();
        assert_eq!(next.change_type, ChangeType::IssuedMore);
        assert_eq!(next.total_issued, 1_500);
        assert_eq!(next.at_block, 12);
    }

    #[test]
    fn transfer_wins_over_other_changes() {
        let data = json!({ "asset": "GOLD", "issuer": "1Bob", "quantity": 0, "transfer": true, "locked": true });
        let next = next_snapshot(&current(), &data, 12, 0).unwrap();
        assert_eq!(next.change_type, ChangeType::Transferred);
        assert_eq!(next.owner.as_deref(), Some("1Bob"));
        assert!(!next.locked);
    }

    #[test]
    fn lock_and_description_changes() {
        let locked = json!({ "asset": "GOLD", "issuer": "1Alice", "quantity": 0, "locked": 1, "description": "gold bars" });
        assert_eq!(next_snapshot(&current(), &locked, 11, 0).unwrap().change_type, ChangeType::Locked);

        let described = json!({ "asset": "GOLD", "issuer": "1Alice", "quantity": 0, "description": "https://x/gold.json" });
        let next = next_snapshot(&current(), &described, 11, 0).unwrap();
        assert_eq!(next.change_type, ChangeType::ChangedDescription);
        assert_eq!(next.total_issued, 1_000);
    }
}
