//! Fluent builder for [`SyncLoop`].
//!
//! # Example
//!
//! ```rust,no_run
//! use blockfeed_core::config::Network;
//! use blockfeed_sync::SyncLoopBuilder;
//!
//! let config = SyncLoopBuilder::new()
//!     .network(Network::Testnet)
//!     .prefetch_count(50)
//!     .max_reorg_blocks(20)
//!     .poll_interval_ms(2_000)
//!     .build_config();
//! ```

use std::sync::Arc;

use blockfeed_core::config::{NativeAsset, Network, SyncConfig};
use blockfeed_core::error::FeedError;
use blockfeed_core::handler::ProcessorRegistry;
use blockfeed_core::store::MaterializedStore;
use blockfeed_core::upstream::UpstreamClient;
use blockfeed_storage::InMemoryStore;

use crate::sync_loop::SyncLoop;
use crate::views::{default_registry, ExtendedInfoFetcher};
use crate::workers::WorkerPool;

/// Fluent builder for `SyncConfig` and `SyncLoop`.
#[derive(Default)]
pub struct SyncLoopBuilder {
    config: SyncConfig,
    upstream: Option<Arc<dyn UpstreamClient>>,
    store: Option<Arc<dyn MaterializedStore>>,
    registry: Option<ProcessorRegistry>,
    extended_info: Option<Arc<dyn ExtendedInfoFetcher>>,
    reparse: bool,
}

impl SyncLoopBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing config.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn network(mut self, network: Network) -> Self {
        self.config.network = network;
        self
    }

    /// Override the network's first tracked block.
    pub fn first_block(mut self, block: u64) -> Self {
        self.config.first_block = Some(block);
        self
    }

    /// Blocks fetched per `get_blocks` round trip.
    pub fn prefetch_count(mut self, n: u64) -> Self {
        self.config.prefetch_count = n;
        self
    }

    pub fn autopilot_threshold(mut self, blocks: u64) -> Self {
        self.config.autopilot_threshold = blocks;
        self
    }

    pub fn autopilot_run(mut self, iterations: u32) -> Self {
        self.config.autopilot_run = iterations;
        self
    }

    /// Safety margin used when the local checkpoint is ahead of upstream.
    pub fn max_reorg_blocks(mut self, blocks: u64) -> Self {
        self.config.max_reorg_blocks = blocks;
        self
    }

    pub fn retry_interval_ms(mut self, ms: u64) -> Self {
        self.config.retry_interval_ms = ms;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn upstream_timeout_ms(mut self, ms: u64) -> Self {
        self.config.upstream_timeout_ms = ms;
        self
    }

    pub fn heartbeat_every(mut self, failures: u32) -> Self {
        self.config.heartbeat_every = failures;
        self
    }

    pub fn mempool_max_age_blocks(mut self, blocks: u64) -> Self {
        self.config.mempool_max_age_blocks = blocks;
        self
    }

    pub fn block_log_interval(mut self, blocks: u64) -> Self {
        self.config.block_log_interval = blocks;
        self
    }

    /// Worker pool sizing for extended-info fetches.
    pub fn workers(mut self, threads: usize, queue: usize) -> Self {
        self.config.worker_threads = threads;
        self.config.worker_queue = queue;
        self
    }

    pub fn native_assets(mut self, assets: Vec<NativeAsset>) -> Self {
        self.config.native_assets = assets;
        self
    }

    pub fn upstream(mut self, upstream: Arc<dyn UpstreamClient>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Defaults to a fresh `InMemoryStore`.
    pub fn store(mut self, store: Arc<dyn MaterializedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the built-in views.
    pub fn registry(mut self, registry: ProcessorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Fetch extended asset info on a worker pool. Ignored when a custom
    /// registry is supplied.
    pub fn extended_info(mut self, fetcher: Arc<dyn ExtendedInfoFetcher>) -> Self {
        self.extended_info = Some(fetcher);
        self
    }

    /// Wipe the views and reparse from the first block on start-up.
    pub fn reparse(mut self, reparse: bool) -> Self {
        self.reparse = reparse;
        self
    }

    /// Build the `SyncConfig`.
    pub fn build_config(self) -> SyncConfig {
        self.config
    }

    /// Build the loop. Must be called inside a tokio runtime when an
    /// extended-info fetcher is set.
    pub fn build(self) -> Result<SyncLoop, FeedError> {
        let upstream = self
            .upstream
            .ok_or_else(|| FeedError::Other("sync loop needs an upstream client".into()))?;
        let store: Arc<dyn MaterializedStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryStore::new()),
        };

        let (registry, workers) = match (self.registry, self.extended_info) {
            (Some(registry), _) => (registry, None),
            (None, Some(fetcher)) => {
                let pool = WorkerPool::spawn(
                    "extended-info",
                    self.config.worker_threads,
                    self.config.worker_queue,
                );
                (default_registry(Some((pool.handle(), fetcher))), Some(pool))
            }
            (None, None) => (default_registry(None), None),
        };

        Ok(SyncLoop::new(
            self.config,
            upstream,
            store,
            registry,
            workers,
            self.reparse,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let cfg = SyncLoopBuilder::new().build_config();
        assert_eq!(cfg.network, Network::Mainnet);
        assert_eq!(cfg.prefetch_count, 100);
        assert_eq!(cfg.max_reorg_blocks, 10);
        assert_eq!(cfg.autopilot_threshold, 500);
    }

    #[test]
    fn builder_custom() {
        let cfg = SyncLoopBuilder::new()
            .network(Network::Regtest)
            .first_block(10)
            .prefetch_count(5)
            .autopilot_threshold(50)
            .autopilot_run(20)
            .max_reorg_blocks(3)
            .workers(2, 16)
            .build_config();

        assert_eq!(cfg.network, Network::Regtest);
        assert_eq!(cfg.first_block(), 10);
        assert_eq!(cfg.prefetch_count, 5);
        assert_eq!(cfg.autopilot_threshold, 50);
        assert_eq!(cfg.autopilot_run, 20);
        assert_eq!(cfg.max_reorg_blocks, 3);
        assert_eq!(cfg.worker_threads, 2);
    }

    #[test]
    fn build_requires_upstream() {
        assert!(SyncLoopBuilder::new().build().is_err());
    }
}
