//! Sync configuration and network selection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Schema version of the materialized views. Bump to force a full reparse.
pub const DB_VERSION: u32 = 12;

/// Chain network the upstream runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// First block carrying protocol messages on this network.
    pub fn first_block(self) -> u64 {
        match self {
            Self::Mainnet => 278_310,
            Self::Testnet => 310_000,
            Self::Regtest => 1,
        }
    }

    pub fn is_testnet(self) -> bool {
        self == Self::Testnet
    }

    pub fn is_regtest(self) -> bool {
        self == Self::Regtest
    }

    /// Derive the network from the upstream's reported flags.
    pub fn from_flags(testnet: bool, regtest: bool) -> Self {
        if regtest {
            Self::Regtest
        } else if testnet {
            Self::Testnet
        } else {
            Self::Mainnet
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Testnet => write!(f, "testnet"),
            Self::Regtest => write!(f, "regtest"),
        }
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            other => Err(format!("unknown network '{other}'")),
        }
    }
}

/// A protocol-native asset seeded at the genesis checkpoint on every reparse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeAsset {
    pub asset: String,
    pub description: String,
    pub divisible: bool,
}

impl NativeAsset {
    pub fn new(asset: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            asset: asset.into(),
            description: description.into(),
            divisible: true,
        }
    }
}

fn default_native_assets() -> Vec<NativeAsset> {
    vec![
        NativeAsset::new("BTC", "The Bitcoin cryptocurrency"),
        NativeAsset::new("XCP", "The Counterparty protocol native currency"),
    ]
}

/// Configuration for a sync loop instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub network: Network,
    /// Overrides [`Network::first_block`] (useful for tests and private chains).
    pub first_block: Option<u64>,
    /// Blocks fetched per `get_blocks` round trip.
    pub prefetch_count: u64,
    /// Distance to the upstream tip above which autopilot engages.
    pub autopilot_threshold: u64,
    /// Iterations autopilot runs before re-querying upstream running info.
    pub autopilot_run: u32,
    /// Safety margin for the defensive rollback when ahead of upstream.
    pub max_reorg_blocks: u64,
    /// Sleep after an upstream failure or a failed block (milliseconds).
    pub retry_interval_ms: u64,
    /// Sleep between polls once at the tip (milliseconds).
    pub poll_interval_ms: u64,
    /// Timeout applied to every upstream call (milliseconds).
    pub upstream_timeout_ms: u64,
    /// Log a heartbeat every N consecutive upstream failures.
    pub heartbeat_every: u32,
    /// Mempool entries older than this many blocks are pruned.
    pub mempool_max_age_blocks: u64,
    /// Log progress every N committed blocks while catching up.
    pub block_log_interval: u64,
    /// Worker pool size for auxiliary fetch jobs.
    pub worker_threads: usize,
    /// Queue capacity of the auxiliary worker pool.
    pub worker_queue: usize,
    pub native_assets: Vec<NativeAsset>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            first_block: None,
            prefetch_count: 100,
            autopilot_threshold: 500,
            autopilot_run: 500,
            max_reorg_blocks: 10,
            retry_interval_ms: 3_000,
            poll_interval_ms: 5_000,
            upstream_timeout_ms: 30_000,
            heartbeat_every: 10,
            mempool_max_age_blocks: 6,
            block_log_interval: 100,
            worker_threads: 4,
            worker_queue: 256,
            native_assets: default_native_assets(),
        }
    }
}

impl SyncConfig {
    /// First block this instance tracks.
    pub fn first_block(&self) -> u64 {
        self.first_block.unwrap_or_else(|| self.network.first_block())
    }

    /// The genesis checkpoint: the block just before the first tracked one.
    pub fn genesis_block(&self) -> u64 {
        self.first_block().saturating_sub(1)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}
