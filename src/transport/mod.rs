//! Transport adapters.
//!
//! One adapter per protocol, all behind the `Adapter` contract:
//! - `http`: POST the payload as JSON to the action's service
//! - `rpc`: JSON-RPC call over a plain TCP connection
//! - `grpc`: unary `LogService/WriteLog` call with a hard deadline
//! - `queue`: publish an envelope to the topic exchange (fire-and-forget)
//!
//! Adapters translate wire outcomes into a `CanonicalResult`. Business
//! failures (bad credentials) are results; only protocol-level problems
//! become a `TransportError`.

use async_trait::async_trait;

use crate::action::{ActionPayload, CanonicalResult};

pub mod grpc;
pub mod http;
pub mod mock;
pub mod queue;
pub mod rpc;

pub use grpc::GrpcAdapter;
pub use http::{HttpAdapter, HttpEndpoints};
pub use mock::MockAdapter;
pub use queue::QueueAdapter;
pub use rpc::RpcAdapter;

/// What an adapter's success means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// The downstream service processed the request.
    SyncCall,
    /// The request was accepted for delivery; processing happens later.
    AsyncPublish,
}

/// Protocol-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("service unreachable: {0}")]
    Unreachable(String),

    #[error("call timed out: {0}")]
    Timeout(String),

    #[error("remote rejected request: {0}")]
    RemoteRejected(String),

    #[error("{adapter} adapter cannot carry '{action}' payloads")]
    Unsupported { adapter: String, action: String },

    #[error("failed to encode payload: {0}")]
    Encoding(String),
}

/// A protocol-specific client for canonical payloads.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short name for logs ("http", "rpc", ...).
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    async fn invoke(&self, payload: &ActionPayload) -> Result<CanonicalResult, TransportError>;
}

pub(crate) fn unsupported(adapter: &str, payload: &ActionPayload) -> TransportError {
    TransportError::Unsupported {
        adapter: adapter.to_string(),
        action: payload.action().to_string(),
    }
}
