//! The upstream indexer interface and its wire types.
//!
//! The upstream parses raw chain transactions into protocol messages and
//! serves them over JSON-RPC. Everything here is read-only; implementations
//! must not retry internally. The sync loop owns backoff.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::FeedError;

/// Response of `get_running_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningInfo {
    /// Last block the upstream has parsed; `None` before its first block.
    #[serde(default)]
    pub last_block: Option<LastBlock>,
    #[serde(default = "no_message_index")]
    pub last_message_index: i64,
    /// Block height of the upstream's own backend (the chain node).
    #[serde(default)]
    pub bitcoin_block_count: Option<u64>,
    /// Whether the upstream is caught up to its backend.
    #[serde(default)]
    pub db_caught_up: bool,
    #[serde(default)]
    pub version_major: u32,
    #[serde(default)]
    pub version_minor: u32,
    #[serde(default)]
    pub running_testnet: bool,
    #[serde(default)]
    pub running_regtest: bool,
}

fn no_message_index() -> i64 {
    -1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastBlock {
    pub block_index: u64,
}

impl RunningInfo {
    /// The upstream's reported tip, if it has parsed anything yet.
    pub fn tip(&self) -> Option<u64> {
        self.last_block.map(|b| b.block_index)
    }
}

/// One protocol message as carried in a block batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_index: i64,
    pub category: String,
    pub command: String,
    /// JSON-encoded bindings; older upstreams send an object, newer a string.
    #[serde(default)]
    pub bindings: Value,
    #[serde(default)]
    pub block_index: Option<u64>,
}

impl Message {
    /// Decode the bindings into a JSON object.
    pub fn decode_bindings(&self) -> Result<Value, FeedError> {
        decode_bindings(&self.bindings)
    }
}

/// A block batch entry from `get_blocks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamBlock {
    pub block_index: u64,
    pub block_hash: String,
    /// Unix timestamp (seconds).
    pub block_time: i64,
    #[serde(rename = "_messages", alias = "messages", default)]
    pub messages: Vec<Message>,
}

/// An unconfirmed transaction from `get_mempool`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MempoolTx {
    pub tx_hash: String,
    pub category: String,
    pub command: String,
    #[serde(default)]
    pub bindings: Value,
    pub timestamp: i64,
}

impl MempoolTx {
    pub fn decode_bindings(&self) -> Result<Value, FeedError> {
        decode_bindings(&self.bindings)
    }
}

/// Sort direction for `get_mempool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderDir {
    Asc,
    Desc,
}

fn decode_bindings(raw: &Value) -> Result<Value, FeedError> {
    match raw {
        Value::String(s) if s.is_empty() => Ok(Value::Object(Default::default())),
        Value::String(s) => serde_json::from_str(s).map_err(FeedError::decode),
        Value::Null => Ok(Value::Object(Default::default())),
        other => Ok(other.clone()),
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, FeedError> {
    serde_json::from_value(value)
        .map_err(|e| FeedError::Upstream(format!("malformed {method} response: {e}")))
}

/// RPC client for the upstream indexer.
///
/// Only [`request`](UpstreamClient::request) is required; the typed calls are
/// built on top of it.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Issue one JSON-RPC call with named params and return its `result`.
    async fn request(&self, method: &str, params: Value) -> Result<Value, FeedError>;

    async fn get_running_info(&self) -> Result<RunningInfo, FeedError> {
        let result = self.request("get_running_info", json!({})).await?;
        decode("get_running_info", result)
    }

    /// Fetch the given blocks with their messages, filtered to
    /// `message_index >= min_message_index` when one is given.
    async fn get_blocks(
        &self,
        block_indexes: &[u64],
        min_message_index: Option<i64>,
    ) -> Result<Vec<UpstreamBlock>, FeedError> {
        let mut params = json!({ "block_indexes": block_indexes });
        if let Some(min) = min_message_index {
            params["min_message_index"] = json!(min);
        }
        let result = self.request("get_blocks", params).await?;
        decode("get_blocks", result)
    }

    async fn get_mempool(
        &self,
        order_by: &str,
        order_dir: OrderDir,
    ) -> Result<Vec<MempoolTx>, FeedError> {
        let params = json!({ "order_by": order_by, "order_dir": order_dir });
        let result = self.request("get_mempool", params).await?;
        decode("get_mempool", result)
    }
}
