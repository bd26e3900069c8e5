//! The rollback primitive.
//!
//! Every recovery path (reorg message, checkpoint ahead of upstream, failed
//! block, startup, reparse, operator request) ends up here. A rollback either
//! keeps everything up to a processed block or wipes all purgeable views and
//! reseeds the native assets at the genesis checkpoint.

use std::sync::Arc;

use blockfeed_core::asset::{AssetSnapshot, ChangeType, TrackedAsset};
use blockfeed_core::config::{NativeAsset, Network, SyncConfig};
use blockfeed_core::error::FeedError;
use blockfeed_core::handler::ProcessorRegistry;
use blockfeed_core::model::AppConfig;
use blockfeed_core::reorg::{RollbackReport, RollbackTarget, RollbackTrigger};
use blockfeed_core::state::SyncState;
use blockfeed_core::store::{Collection, MaterializedStore};

use crate::block_cache::BlockCache;

pub struct ReorgEngine {
    store: Arc<dyn MaterializedStore>,
    network: Network,
    genesis_block: u64,
    native_assets: Vec<NativeAsset>,
}

impl ReorgEngine {
    pub fn new(store: Arc<dyn MaterializedStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            network: config.network,
            genesis_block: config.genesis_block(),
            native_assets: config.native_assets.clone(),
        }
    }

    /// Roll the views back to `target`.
    ///
    /// For [`RollbackTarget::Block`] the block must exist in
    /// `processed_blocks`; otherwise this fails with `InvalidRollbackTarget`
    /// before touching anything.
    pub async fn rollback(
        &self,
        state: &mut SyncState,
        cache: &mut BlockCache,
        registry: &ProcessorRegistry,
        target: RollbackTarget,
        trigger: RollbackTrigger,
    ) -> Result<RollbackReport, FeedError> {
        let report = match target {
            RollbackTarget::Block(block_index) => {
                let Some(kept) = self.store.processed_block(block_index).await? else {
                    return Err(FeedError::InvalidRollbackTarget(block_index));
                };
                let blocks_removed = self.store.delete_processed_blocks_after(block_index).await?;
                let (assets_restored, assets_deleted) = self.rewind_assets(block_index).await?;
                cache.clear();
                state.rolled_back_to(Some(kept));
                RollbackReport {
                    target,
                    trigger,
                    blocks_removed,
                    assets_restored,
                    assets_deleted,
                }
            }
            RollbackTarget::FullWipe => {
                let blocks_removed = self.store.processed_blocks().await?.len() as u64;
                let assets_deleted = self.store.tracked_assets().await?.len() as u64;
                self.wipe().await?;
                cache.clear();
                state.rolled_back_to(None);
                RollbackReport {
                    target,
                    trigger,
                    blocks_removed,
                    assets_restored: 0,
                    assets_deleted,
                }
            }
        };

        registry.dispatch_rollback(target, self.store.as_ref()).await?;

        tracing::warn!(
            %target,
            %trigger,
            blocks_removed = report.blocks_removed,
            assets_restored = report.assets_restored,
            assets_deleted = report.assets_deleted,
            "rolled back"
        );
        Ok(report)
    }

    /// Roll back to the highest processed block at or below `at_or_below`,
    /// or wipe everything if there is none.
    pub async fn rollback_at_or_below(
        &self,
        state: &mut SyncState,
        cache: &mut BlockCache,
        registry: &ProcessorRegistry,
        at_or_below: u64,
        trigger: RollbackTrigger,
    ) -> Result<RollbackReport, FeedError> {
        let target = match self.store.latest_processed_block_at_or_below(at_or_below).await? {
            Some(block) => RollbackTarget::Block(block.block_index),
            None => RollbackTarget::FullWipe,
        };
        self.rollback(state, cache, registry, target, trigger).await
    }

    /// Truncate every snapshot log changed after `block_index`.
    async fn rewind_assets(&self, block_index: u64) -> Result<(u64, u64), FeedError> {
        let mut restored = 0;
        let mut deleted = 0;
        for mut asset in self.store.tracked_assets_changed_after(block_index).await? {
            if asset.rollback_to(block_index) {
                self.store.save_tracked_asset(&asset).await?;
                restored += 1;
            } else {
                self.store.delete_tracked_asset(&asset.asset).await?;
                deleted += 1;
            }
        }
        Ok((restored, deleted))
    }

    /// Drop every purgeable collection and reseed the native assets.
    /// The stored app config survives the wipe.
    async fn wipe(&self) -> Result<(), FeedError> {
        let app_config = self
            .store
            .load_app_config()
            .await?
            .unwrap_or_else(|| AppConfig::current(self.network));

        for collection in Collection::PURGEABLE {
            self.store.purge(collection).await?;
        }
        self.store.save_app_config(&app_config).await?;
        self.seed_native_assets().await
    }

    async fn seed_native_assets(&self) -> Result<(), FeedError> {
        for native in &self.native_assets {
            let asset = TrackedAsset::new(
                native.asset.clone(),
                AssetSnapshot {
                    owner: None,
                    description: native.description.clone(),
                    divisible: native.divisible,
                    locked: true,
                    total_issued: 0,
                    at_block: self.genesis_block,
                    at_block_time: 0,
                    change_type: ChangeType::Created,
                },
            );
            self.store.save_tracked_asset(&asset).await?;
        }
        tracing::debug!(
            count = self.native_assets.len(),
            at_block = self.genesis_block,
            "native assets seeded"
        );
        Ok(())
    }
}
