//! The `RpcTransport` trait.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// An async JSON-RPC transport, object-safe so it can live behind `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single request and return the raw response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Identifier of the endpoint (URL or name).
    fn url(&self) -> &str;

    /// Call `method` and return the `result` value.
    async fn call_value(
        &self,
        id: u64,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        let resp = self.send(JsonRpcRequest::new(id, method, params)).await?;
        resp.into_result().map_err(TransportError::Rpc)
    }

    /// Call `method` and deserialize the result.
    async fn call<T: DeserializeOwned>(
        &self,
        id: u64,
        method: &str,
        params: Value,
    ) -> Result<T, TransportError>
    where
        Self: Sized,
    {
        let result = self.call_value(id, method, params).await?;
        serde_json::from_value(result).map_err(TransportError::Deserialization)
    }
}
