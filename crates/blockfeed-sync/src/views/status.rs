//! Drops invalid protocol events before any view sees them.

use async_trait::async_trait;
use serde_json::Value;

use blockfeed_core::error::FeedError;
use blockfeed_core::handler::{ControlSignal, MempoolProcessor, MessageProcessor};
use blockfeed_core::types::{IndexContext, MempoolContext};
use blockfeed_core::upstream::{MempoolTx, Message};

/// Returns `AbortMessage` for anything whose `status` starts with `invalid`.
pub struct StatusFilter;

fn verdict(data: &Value) -> ControlSignal {
    match data.get("status").and_then(Value::as_str) {
        Some(status) if status.starts_with("invalid") => ControlSignal::AbortMessage,
        _ => ControlSignal::Continue,
    }
}

#[async_trait]
impl MessageProcessor for StatusFilter {
    async fn process(
        &self,
        msg: &Message,
        data: &Value,
        _ctx: &IndexContext<'_>,
    ) -> Result<ControlSignal, FeedError> {
        let signal = verdict(data);
        if signal == ControlSignal::AbortMessage {
            tracing::trace!(message_index = msg.message_index, category = %msg.category, "invalid message skipped");
        }
        Ok(signal)
    }
}

#[async_trait]
impl MempoolProcessor for StatusFilter {
    async fn process(
        &self,
        _tx: &MempoolTx,
        data: &Value,
        _ctx: &MempoolContext<'_>,
    ) -> Result<ControlSignal, FeedError> {
        Ok(verdict(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalid_statuses_abort() {
        assert_eq!(verdict(&json!({ "status": "invalid: insufficient funds" })), ControlSignal::AbortMessage);
        assert_eq!(verdict(&json!({ "status": "valid" })), ControlSignal::Continue);
        assert_eq!(verdict(&json!({})), ControlSignal::Continue);
    }
}
