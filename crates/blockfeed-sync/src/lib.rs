//! blockfeed-sync — the block synchronization and reorg-recovery engine.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blockfeed_core::config::Network;
//! use blockfeed_sync::{HttpUpstream, SyncLoopBuilder};
//!
//! # async fn example() -> Result<(), blockfeed_core::FeedError> {
//! let upstream = HttpUpstream::connect("http://127.0.0.1:4000/api/", Default::default())?;
//! let mut sync = SyncLoopBuilder::new()
//!     .network(Network::Testnet)
//!     .upstream(Arc::new(upstream))
//!     .build()?;
//!
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! sync.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod block_cache;
pub mod builder;
pub mod mempool;
pub mod reorg;
pub mod sync_loop;
pub mod upstream;
pub mod views;
pub mod workers;

pub use block_cache::BlockCache;
pub use builder::SyncLoopBuilder;
pub use mempool::MempoolRefresher;
pub use reorg::ReorgEngine;
pub use sync_loop::{Step, SyncLoop};
pub use upstream::HttpUpstream;
pub use views::default_registry;
pub use workers::WorkerPool;
