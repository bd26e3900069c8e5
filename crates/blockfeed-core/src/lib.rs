//! blockfeed-core — foundation for a reorg-safe follower of a protocol message feed.
//!
//! # Architecture
//!
//! ```text
//! SyncLoop (blockfeed-sync)
//!     ├── UpstreamClient     (running info, blocks with messages, mempool)
//!     ├── BlockCache         (prefetch window over get_blocks)
//!     ├── ProcessorRegistry  (prioritized message / block / lifecycle / rollback processors)
//!     ├── ReorgEngine        (rollback to a processed block or full wipe)
//!     └── MaterializedStore  (memory / SQLite)
//! ```
//!
//! This crate holds the shared types and traits; the loop itself lives in
//! `blockfeed-sync` and the store backends in `blockfeed-storage`.

pub mod asset;
pub mod config;
pub mod error;
pub mod handler;
pub mod model;
pub mod reorg;
pub mod state;
pub mod store;
pub mod types;
pub mod upstream;

pub use asset::{AssetSnapshot, ChangeType, TrackedAsset};
pub use config::{NativeAsset, Network, SyncConfig, DB_VERSION};
pub use error::FeedError;
pub use handler::{
    BlockProcessor, ControlSignal, LifecycleHook, MempoolProcessor, MessageOutcome,
    MessageProcessor, ModuleInfo, ProcessorRegistry, RollbackProcessor,
};
pub use model::{AppConfig, BalanceChange, MempoolEntry, Trade, TransactionStat};
pub use reorg::{RollbackReport, RollbackTarget, RollbackTrigger};
pub use state::{SyncPhase, SyncSnapshot, SyncState};
pub use store::{Collection, MaterializedStore};
pub use types::{IndexContext, MempoolContext, ProcessedBlock};
pub use upstream::{MempoolTx, Message, OrderDir, RunningInfo, UpstreamBlock, UpstreamClient};
