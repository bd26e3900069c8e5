//! Scripted upstream shared by the sync integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use blockfeed_core::config::Network;
use blockfeed_core::error::FeedError;
use blockfeed_core::store::MaterializedStore;
use blockfeed_core::upstream::{Message, MempoolTx, UpstreamBlock, UpstreamClient};
use blockfeed_storage::InMemoryStore;
use blockfeed_sync::SyncLoopBuilder;

// ─── MockUpstream ─────────────────────────────────────────────────────────────

struct Chain {
    blocks: BTreeMap<u64, UpstreamBlock>,
    next_message_index: i64,
    tip: Option<u64>,
    db_caught_up: bool,
    version: (u32, u32),
    network: Network,
    mempool: Vec<MempoolTx>,
    fail_next: u32,
    calls: Vec<String>,
}

/// An in-memory upstream whose chain is scripted by the test.
///
/// Message indexes are assigned globally in push order, like the real feed.
pub struct MockUpstream {
    chain: Mutex<Chain>,
}

pub fn block_hash(index: u64, fork: u32) -> String {
    format!("{fork:08x}{index:056x}")
}

impl MockUpstream {
    pub fn new(network: Network) -> Self {
        Self {
            chain: Mutex::new(Chain {
                blocks: BTreeMap::new(),
                next_message_index: 0,
                tip: None,
                db_caught_up: true,
                version: (9, 61),
                network,
                mempool: Vec::new(),
                fail_next: 0,
                calls: Vec::new(),
            }),
        }
    }

    pub fn regtest() -> Self {
        Self::new(Network::Regtest)
    }

    /// Make sure blocks `1..=to` exist (empty unless pushed to) and move the
    /// tip to `to`.
    pub fn extend_to(&self, to: u64) {
        let mut chain = self.chain.lock().unwrap();
        for index in 1..=to {
            chain.blocks.entry(index).or_insert_with(|| UpstreamBlock {
                block_index: index,
                block_hash: block_hash(index, 0),
                block_time: index as i64 * 600,
                messages: Vec::new(),
            });
        }
        chain.tip = Some(to);
    }

    /// Append an insert message to `block`, creating the block if needed.
    /// Returns the assigned message index.
    pub fn push(&self, block: u64, category: &str, bindings: Value) -> i64 {
        let mut chain = self.chain.lock().unwrap();
        let message_index = chain.next_message_index;
        chain.next_message_index += 1;
        let entry = chain.blocks.entry(block).or_insert_with(|| UpstreamBlock {
            block_index: block,
            block_hash: block_hash(block, 0),
            block_time: block as i64 * 600,
            messages: Vec::new(),
        });
        entry.messages.push(Message {
            message_index,
            category: category.to_string(),
            command: "insert".to_string(),
            bindings: Value::String(bindings.to_string()),
            block_index: Some(block),
        });
        message_index
    }

    /// Leave a hole in the message index sequence.
    pub fn skip_message_indexes(&self, n: i64) {
        self.chain.lock().unwrap().next_message_index += n;
    }

    /// Replace blocks `from..` with empty blocks on a different fork.
    pub fn fork_from(&self, from: u64, fork: u32) {
        let mut chain = self.chain.lock().unwrap();
        for (index, block) in chain.blocks.range_mut(from..) {
            block.block_hash = block_hash(*index, fork);
            block.messages.clear();
        }
    }

    pub fn set_tip(&self, tip: Option<u64>) {
        self.chain.lock().unwrap().tip = tip;
    }

    pub fn set_caught_up(&self, caught_up: bool) {
        self.chain.lock().unwrap().db_caught_up = caught_up;
    }

    pub fn set_version(&self, major: u32, minor: u32) {
        self.chain.lock().unwrap().version = (major, minor);
    }

    pub fn set_mempool(&self, txs: Vec<MempoolTx>) {
        self.chain.lock().unwrap().mempool = txs;
    }

    /// Fail the next `n` requests as unreachable.
    pub fn fail_next(&self, n: u32) {
        self.chain.lock().unwrap().fail_next = n;
    }

    pub fn calls(&self, method: &str) -> usize {
        self.chain
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|m| *m == method)
            .count()
    }

    fn running_info(chain: &Chain) -> Value {
        let last_message_index = chain
            .blocks
            .values()
            .filter(|b| chain.tip.map_or(false, |tip| b.block_index <= tip))
            .flat_map(|b| b.messages.iter().map(|m| m.message_index))
            .max()
            .unwrap_or(-1);
        json!({
            "last_block": chain.tip.map(|tip| json!({ "block_index": tip })),
            "last_message_index": last_message_index,
            "bitcoin_block_count": chain.tip,
            "db_caught_up": chain.db_caught_up,
            "version_major": chain.version.0,
            "version_minor": chain.version.1,
            "running_testnet": chain.network.is_testnet(),
            "running_regtest": chain.network.is_regtest(),
        })
    }

    fn blocks(chain: &Chain, params: &Value) -> Value {
        let min = params.get("min_message_index").and_then(Value::as_i64);
        let tip = chain.tip.unwrap_or(0);
        let blocks: Vec<UpstreamBlock> = params["block_indexes"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_u64)
            .filter(|index| *index <= tip)
            .filter_map(|index| chain.blocks.get(&index))
            .map(|block| {
                let mut block = block.clone();
                if let Some(min) = min {
                    block.messages.retain(|m| m.message_index >= min);
                }
                block
            })
            .collect();
        serde_json::to_value(blocks).unwrap()
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn request(&self, method: &str, params: Value) -> Result<Value, FeedError> {
        let mut chain = self.chain.lock().unwrap();
        chain.calls.push(method.to_string());
        if chain.fail_next > 0 {
            chain.fail_next -= 1;
            return Err(FeedError::UpstreamUnreachable("connection refused".into()));
        }
        match method {
            "get_running_info" => Ok(Self::running_info(&chain)),
            "get_blocks" => Ok(Self::blocks(&chain, &params)),
            "get_mempool" => Ok(serde_json::to_value(&chain.mempool).unwrap()),
            other => Err(FeedError::Upstream(format!("unknown method {other}"))),
        }
    }
}

// ─── Fixtures ─────────────────────────────────────────────────────────────────

pub fn credit(address: &str, asset: &str, quantity: i64, tx_hash: &str) -> Value {
    json!({
        "address": address,
        "asset": asset,
        "quantity": quantity,
        "tx_hash": tx_hash,
        "calling_function": "send",
    })
}

pub fn debit(address: &str, asset: &str, quantity: i64, tx_hash: &str) -> Value {
    json!({
        "address": address,
        "asset": asset,
        "quantity": quantity,
        "tx_hash": tx_hash,
        "action": "send",
    })
}

pub fn issuance(asset: &str, issuer: &str, quantity: i64, description: &str) -> Value {
    json!({
        "asset": asset,
        "issuer": issuer,
        "quantity": quantity,
        "divisible": true,
        "locked": false,
        "transfer": false,
        "description": description,
        "status": "valid",
        "tx_hash": format!("iss-{asset}-{quantity}"),
    })
}

pub fn mempool_tx(tx_hash: &str, category: &str, bindings: Value, timestamp: i64) -> MempoolTx {
    MempoolTx {
        tx_hash: tx_hash.to_string(),
        category: category.to_string(),
        command: "insert".to_string(),
        bindings: Value::String(bindings.to_string()),
        timestamp,
    }
}

/// Builder preset for regtest with small windows and no sleeping.
pub fn regtest_builder(upstream: Arc<MockUpstream>, store: Arc<InMemoryStore>) -> SyncLoopBuilder {
    let upstream: Arc<dyn UpstreamClient> = upstream;
    let store: Arc<dyn MaterializedStore> = store;
    SyncLoopBuilder::new()
        .network(Network::Regtest)
        .prefetch_count(7)
        .retry_interval_ms(1)
        .poll_interval_ms(1)
        .upstream(upstream)
        .store(store)
}
