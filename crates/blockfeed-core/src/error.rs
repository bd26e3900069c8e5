//! Error types for the blockfeed pipeline.

use thiserror::Error;

/// Errors that can occur while following the upstream message feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The upstream indexer could not be reached (connect failure, timeout).
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The upstream answered with a bad HTTP status or a JSON-RPC error.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// A message arrived out of sequence without an explicit reorg message.
    #[error(
        "message sequence violation in block {block_index}: expected message_index {expected}, got {actual}"
    )]
    ProtocolSequenceViolation {
        block_index: u64,
        expected: i64,
        actual: i64,
    },

    /// Rollback target does not exist in `processed_blocks`.
    #[error("cannot roll back to block {0}: no processed block at that index")]
    InvalidRollbackTarget(u64),

    #[error("block {block_index} failed to apply: {reason}")]
    BlockApplication { block_index: u64, reason: String },

    /// A message processor asked to abandon the current block.
    #[error("block {block_index} aborted by '{handler}' at message {message_index}")]
    BlockAborted {
        block_index: u64,
        message_index: i64,
        handler: String,
    },

    /// Persisted schema/network or upstream version differs from the running build.
    #[error("version mismatch: {0}")]
    VersionMismatch(String),

    /// Upstream runs on a different network than this process was configured for.
    #[error("network mismatch: configured {configured}, upstream reports {upstream}")]
    NetworkMismatch { configured: String, upstream: String },

    #[error("handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl FeedError {
    /// Returns `true` for upstream I/O failures that are retried after a fixed delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::UpstreamUnreachable(_) | Self::Upstream(_))
    }

    /// Returns `true` for integrity violations that must end the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ProtocolSequenceViolation { .. }
                | Self::InvalidRollbackTarget(_)
                | Self::NetworkMismatch { .. }
        )
    }

    pub fn storage(e: impl std::fmt::Display) -> Self {
        Self::Storage(e.to_string())
    }

    pub fn decode(e: impl std::fmt::Display) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
