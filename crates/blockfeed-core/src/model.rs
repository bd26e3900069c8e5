//! Documents persisted in the materialized store (besides blocks and assets).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Network, DB_VERSION};
use crate::upstream::RunningInfo;

// ─── AppConfig ────────────────────────────────────────────────────────────────

/// Singleton describing what build and network produced the stored views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    pub db_version: u32,
    pub running_testnet: bool,
    pub running_regtest: bool,
    /// Upstream version the views were built from; unset until first contact.
    pub upstream_version_major: Option<u32>,
    pub upstream_version_minor: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

impl AppConfig {
    /// Fresh config for the running build on `network`.
    pub fn current(network: Network) -> Self {
        Self {
            db_version: DB_VERSION,
            running_testnet: network.is_testnet(),
            running_regtest: network.is_regtest(),
            upstream_version_major: None,
            upstream_version_minor: None,
            updated_at: Utc::now(),
        }
    }

    /// Describe why this config can't be reused by the running build, if so.
    pub fn drift_from_build(&self, network: Network) -> Option<String> {
        if self.db_version != DB_VERSION {
            return Some(format!(
                "db version {} != build version {DB_VERSION}",
                self.db_version
            ));
        }
        if self.running_testnet != network.is_testnet() || self.running_regtest != network.is_regtest() {
            return Some(format!(
                "views were built for {}, running on {network}",
                Network::from_flags(self.running_testnet, self.running_regtest)
            ));
        }
        None
    }

    /// Describe an upstream version change since the views were built.
    pub fn drift_from_upstream(&self, info: &RunningInfo) -> Option<String> {
        match (self.upstream_version_major, self.upstream_version_minor) {
            (Some(major), Some(minor))
                if major != info.version_major || minor != info.version_minor =>
            {
                Some(format!(
                    "upstream version changed from {major}.{minor} to {}.{}",
                    info.version_major, info.version_minor
                ))
            }
            _ => None,
        }
    }

    pub fn record_upstream(&mut self, info: &RunningInfo) {
        self.upstream_version_major = Some(info.version_major);
        self.upstream_version_minor = Some(info.version_minor);
        self.updated_at = Utc::now();
    }

    pub fn has_upstream_fingerprint(&self) -> bool {
        self.upstream_version_major.is_some() && self.upstream_version_minor.is_some()
    }
}

// ─── BalanceChange ────────────────────────────────────────────────────────────

/// Net balance movement of one (address, asset) pair within one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub address: String,
    pub asset: String,
    pub block_index: u64,
    pub block_time: i64,
    /// Signed sum of credits and debits in this block.
    pub quantity: i64,
    /// Balance after this block.
    pub new_balance: i64,
}

// ─── Trade ────────────────────────────────────────────────────────────────────

/// A completed order match, oriented as base/quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub order_match_id: String,
    pub block_index: u64,
    pub block_time: i64,
    pub message_index: i64,
    pub order_match_tx0_hash: String,
    pub order_match_tx1_hash: String,
    pub order_match_tx0_address: String,
    pub order_match_tx1_address: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub base_quantity: i64,
    pub quote_quantity: i64,
    pub base_quantity_normalized: f64,
    pub quote_quantity_normalized: f64,
    pub unit_price: f64,
}

// ─── TransactionStat ──────────────────────────────────────────────────────────

/// Count of protocol messages of one category within one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStat {
    pub block_index: u64,
    pub block_time: i64,
    pub category: String,
    pub count: u64,
}

// ─── MempoolEntry ─────────────────────────────────────────────────────────────

/// An unconfirmed transaction seen in the upstream mempool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MempoolEntry {
    pub tx_hash: String,
    pub category: String,
    pub command: String,
    pub bindings: serde_json::Value,
    pub timestamp: i64,
    /// Local tip when the entry was first seen; drives pruning.
    pub seen_at_block: u64,
    pub first_seen: DateTime<Utc>,
}
