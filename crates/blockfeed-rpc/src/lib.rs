//! blockfeed-rpc — JSON-RPC transport to the upstream indexer.
//!
//! - [`RpcTransport`] — the async trait a transport implements
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`] — wire types (named params)
//! - [`TransportError`] — structured error type
//! - [`HttpRpcClient`] — `reqwest`-backed transport with a request timeout
//!
//! Transports never retry; the sync loop owns retry pacing.

pub mod error;
pub mod http;
pub mod request;
pub mod transport;

pub use error::TransportError;
pub use http::{HttpClientConfig, HttpRpcClient};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use transport::RpcTransport;
