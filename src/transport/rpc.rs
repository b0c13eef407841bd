//! Binary-RPC adapter.
//!
//! Speaks JSON-RPC 1.0 over a plain TCP connection: one request object and
//! one response object per line. The remote procedure takes `{Name, Data}`
//! and answers with a string. Only log payloads have a procedure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::{unsupported, Adapter, Capability, TransportError};
use crate::action::{ActionPayload, CanonicalResult};

/// Argument of the remote log procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RpcLogArgs {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest<P> {
    pub method: String,
    pub params: [P; 1],
    pub id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

pub struct RpcAdapter {
    address: String,
    method: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcAdapter {
    pub fn new(address: impl Into<String>, method: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            method: method.into(),
            timeout,
            next_id: AtomicU64::new(0),
        }
    }

    async fn call(&self, args: RpcLogArgs) -> Result<String, TransportError> {
        let unreachable =
            |e: std::io::Error| TransportError::Unreachable(format!("{}: {}", self.address, e));

        let mut stream = TcpStream::connect(&self.address).await.map_err(unreachable)?;

        let request = RpcRequest {
            method: self.method.clone(),
            params: [args],
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let mut line =
            serde_json::to_vec(&request).map_err(|e| TransportError::Encoding(e.to_string()))?;
        line.push(b'\n');
        stream.write_all(&line).await.map_err(unreachable)?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        let read = reader.read_line(&mut reply).await.map_err(unreachable)?;
        if read == 0 {
            return Err(TransportError::Unreachable(format!(
                "{}: connection closed before reply",
                self.address
            )));
        }

        let response: RpcResponse = serde_json::from_str(&reply).map_err(|e| {
            TransportError::RemoteRejected(format!("malformed reply: {}", e))
        })?;
        if response.id != request.id {
            return Err(TransportError::RemoteRejected(format!(
                "reply id {} does not match request id {}",
                response.id, request.id
            )));
        }

        match (response.error, response.result) {
            (Some(error), _) if !error.is_null() => Err(TransportError::RemoteRejected(
                error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string()),
            )),
            (_, Some(Value::String(result))) => Ok(result),
            (_, other) => Err(TransportError::RemoteRejected(format!(
                "expected string result, got {}",
                other.unwrap_or(Value::Null)
            ))),
        }
    }
}

#[async_trait]
impl Adapter for RpcAdapter {
    fn name(&self) -> &str {
        "rpc"
    }

    fn capability(&self) -> Capability {
        Capability::SyncCall
    }

    async fn invoke(&self, payload: &ActionPayload) -> Result<CanonicalResult, TransportError> {
        let ActionPayload::Log(entry) = payload else {
            return Err(unsupported(self.name(), payload));
        };
        let args = RpcLogArgs {
            name: entry.name.clone(),
            data: entry.data.clone(),
        };

        let result = tokio::time::timeout(self.timeout, self.call(args))
            .await
            .map_err(|_| {
                TransportError::Timeout(format!("{} after {:?}", self.method, self.timeout))
            })??;

        debug!(address = %self.address, method = %self.method, "RPC call returned");
        Ok(CanonicalResult::success(result))
    }
}
