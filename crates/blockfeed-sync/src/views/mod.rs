//! Materialized views shipped with the sync engine.
//!
//! Each view is an independent processor (plus a rollback hook where it owns
//! a collection) registered at a fixed priority:
//!
//! | module              | priority | consumes                          |
//! |---------------------|----------|-----------------------------------|
//! | `status_filter`     | 1000     | every message, every mempool tx   |
//! | `assets`            | 100      | issuances                         |
//! | `balances`          | 90       | credits, debits                   |
//! | `trades`            | 80       | completed order_matches           |
//! | `transaction_stats` | 10       | inserts of transaction categories |

pub mod assets;
pub mod balances;
pub mod stats;
pub mod status;
pub mod trades;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use blockfeed_core::error::FeedError;
use blockfeed_core::handler::ProcessorRegistry;

use crate::workers::WorkerHandle;

pub use assets::{AssetTracker, ExtendedInfoFetcher};
pub use balances::BalanceTracker;
pub use stats::TransactionStats;
pub use status::StatusFilter;
pub use trades::TradeBook;

pub const STATUS_FILTER: &str = "status_filter";
pub const ASSETS: &str = "assets";
pub const BALANCES: &str = "balances";
pub const TRADES: &str = "trades";
pub const TRANSACTION_STATS: &str = "transaction_stats";

/// Registry with every built-in view enabled.
///
/// When `extended_info` is given, the asset tracker hands `.json`
/// descriptions to the fetcher on the worker pool.
pub fn default_registry(
    extended_info: Option<(WorkerHandle, Arc<dyn ExtendedInfoFetcher>)>,
) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();

    let status = Arc::new(StatusFilter);
    registry.on_message(STATUS_FILTER, 1000, true, status.clone());
    registry.on_mempool(STATUS_FILTER, 1000, true, status);

    let assets = match extended_info {
        Some((workers, fetcher)) => AssetTracker::with_extended_info(workers, fetcher),
        None => AssetTracker::new(),
    };
    registry.on_message(ASSETS, 100, true, Arc::new(assets));

    let balances = Arc::new(BalanceTracker);
    registry.on_message(BALANCES, 90, true, balances.clone());
    registry.on_rollback(BALANCES, 90, true, balances);

    let trades = Arc::new(TradeBook::default());
    registry.on_message(TRADES, 80, true, trades.clone());
    registry.on_rollback(TRADES, 80, true, trades);

    let stats = Arc::new(TransactionStats);
    registry.on_message(TRANSACTION_STATS, 10, true, stats.clone());
    registry.on_rollback(TRANSACTION_STATS, 10, true, stats);

    registry
}

/// Apply persisted enable/disable flags; returns names with no registered module.
pub fn apply_module_settings(
    registry: &mut ProcessorRegistry,
    settings: &BTreeMap<String, bool>,
) -> Vec<String> {
    settings
        .iter()
        .filter(|(name, enabled)| !registry.set_enabled(name, **enabled))
        .map(|(name, _)| name.clone())
        .collect()
}

// ─── Binding accessors ────────────────────────────────────────────────────────

pub(crate) fn is_insert(command: &str) -> bool {
    command == "insert"
}

pub(crate) fn str_field<'a>(data: &'a Value, key: &str) -> Result<&'a str, FeedError> {
    data.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| FeedError::Decode(format!("missing string field '{key}'")))
}

pub(crate) fn i64_field(data: &Value, key: &str) -> Result<i64, FeedError> {
    data.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| FeedError::Decode(format!("missing integer field '{key}'")))
}

/// Booleans arrive either as JSON booleans or as 0/1.
pub(crate) fn bool_field(data: &Value, key: &str) -> bool {
    match data.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}
