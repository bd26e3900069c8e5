//! Unconfirmed transactions mirrored from the upstream mempool.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;

use blockfeed_core::config::Network;
use blockfeed_core::error::FeedError;
use blockfeed_core::handler::{MessageOutcome, ProcessorRegistry};
use blockfeed_core::model::MempoolEntry;
use blockfeed_core::store::MaterializedStore;
use blockfeed_core::types::MempoolContext;
use blockfeed_core::upstream::{OrderDir, UpstreamClient};

use crate::sync_loop::timed;

pub struct MempoolRefresher {
    max_age_blocks: u64,
}

impl MempoolRefresher {
    pub fn new(max_age_blocks: u64) -> Self {
        Self { max_age_blocks }
    }

    /// Pull the upstream mempool, store unseen transactions and run them
    /// through the mempool processors. Returns how many were new.
    ///
    /// `limit` bounds the upstream call only; once a tx is stored it is
    /// always dispatched.
    pub async fn refresh(
        &self,
        upstream: &dyn UpstreamClient,
        store: &dyn MaterializedStore,
        registry: &ProcessorRegistry,
        network: Network,
        tip: u64,
        limit: Duration,
    ) -> Result<usize, FeedError> {
        let txs = timed(limit, upstream.get_mempool("timestamp", OrderDir::Asc)).await?;
        let ctx = MempoolContext { tip, network, store };

        // One tx can carry several messages; all of them go to the processors.
        let mut fresh: HashSet<String> = HashSet::new();
        for tx in &txs {
            let data = match tx.decode_bindings() {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(
                        tx_hash = %tx.tx_hash,
                        category = %tx.category,
                        error = %e,
                        "skipping mempool tx with undecodable bindings"
                    );
                    continue;
                }
            };

            if !fresh.contains(&tx.tx_hash) {
                let entry = MempoolEntry {
                    tx_hash: tx.tx_hash.clone(),
                    category: tx.category.clone(),
                    command: tx.command.clone(),
                    bindings: data.clone(),
                    timestamp: tx.timestamp,
                    seen_at_block: tip,
                    first_seen: Utc::now(),
                };
                if !store.insert_mempool_entry(&entry).await? {
                    continue;
                }
                fresh.insert(tx.tx_hash.clone());
            }

            match registry.dispatch_mempool(tx, &data, &ctx).await? {
                MessageOutcome::Applied => {}
                MessageOutcome::Skipped { by } | MessageOutcome::AbortBlock { by } => {
                    tracing::trace!(tx_hash = %tx.tx_hash, %by, "mempool tx skipped");
                }
            }
        }

        if !fresh.is_empty() {
            tracing::debug!(new = fresh.len(), total = txs.len(), tip, "mempool refreshed");
        }
        Ok(fresh.len())
    }

    /// Drop entries confirmed in `block_index` and those too old to matter.
    pub async fn on_block_committed(
        &self,
        store: &dyn MaterializedStore,
        block_index: u64,
        confirmed: &[String],
    ) -> Result<(), FeedError> {
        for tx_hash in confirmed {
            store.remove_mempool_entry(tx_hash).await?;
        }
        let pruned = store
            .prune_mempool(block_index.saturating_sub(self.max_age_blocks))
            .await?;
        if pruned > 0 {
            tracing::debug!(pruned, block_index, "stale mempool entries pruned");
        }
        Ok(())
    }
}
