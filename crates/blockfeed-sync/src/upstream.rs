//! `UpstreamClient` over the HTTP JSON-RPC transport.

use async_trait::async_trait;
use serde_json::Value;

use blockfeed_core::error::FeedError;
use blockfeed_core::upstream::UpstreamClient;
use blockfeed_rpc::{HttpClientConfig, HttpRpcClient, RpcTransport, TransportError};

/// Upstream indexer reached over HTTP JSON-RPC.
pub struct HttpUpstream {
    client: HttpRpcClient,
}

impl HttpUpstream {
    pub fn new(client: HttpRpcClient) -> Self {
        Self { client }
    }

    pub fn connect(url: &str, config: HttpClientConfig) -> Result<Self, FeedError> {
        let client = HttpRpcClient::new(url, config).map_err(into_feed_error)?;
        Ok(Self::new(client))
    }

    pub fn url(&self) -> &str {
        self.client.url()
    }
}

/// Map transport failures onto the feed taxonomy; all of them are transient.
pub fn into_feed_error(e: TransportError) -> FeedError {
    match e {
        TransportError::Unreachable(_) | TransportError::Timeout { .. } => {
            FeedError::UpstreamUnreachable(e.to_string())
        }
        TransportError::BadStatus { .. }
        | TransportError::Rpc(_)
        | TransportError::Deserialization(_)
        | TransportError::Other(_) => FeedError::Upstream(e.to_string()),
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn request(&self, method: &str, params: Value) -> Result<Value, FeedError> {
        let id = self.client.next_id();
        tracing::trace!(id, method, "upstream request");
        self.client
            .call_value(id, method, params)
            .await
            .map_err(into_feed_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockfeed_rpc::JsonRpcError;

    #[test]
    fn transport_errors_are_transient() {
        let unreachable = into_feed_error(TransportError::Timeout { ms: 5 });
        assert!(matches!(unreachable, FeedError::UpstreamUnreachable(_)));

        let remote = into_feed_error(TransportError::Rpc(JsonRpcError {
            code: -32601,
            message: "method not found".into(),
            data: None,
        }));
        assert!(matches!(remote, FeedError::Upstream(_)));
        assert!(remote.is_transient());
    }
}
