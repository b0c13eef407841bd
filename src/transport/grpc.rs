//! gRPC adapter.
//!
//! Unary `logs.LogService/WriteLog` over plaintext HTTP/2. Each call opens
//! a channel and is bounded by one deadline covering connect and call.

use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::Endpoint;
use tonic::{Code, Status};
use tracing::debug;

use super::{unsupported, Adapter, Capability, TransportError};
use crate::action::{ActionPayload, CanonicalResult, LogPayload};
use crate::proto::log_service_client::LogServiceClient;
use crate::proto::{Log, LogRequest};

pub struct GrpcAdapter {
    uri: String,
    deadline: Duration,
}

impl GrpcAdapter {
    /// `address` is `host:port` or a full `http://` URI.
    pub fn new(address: &str, deadline: Duration) -> Self {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        Self { uri, deadline }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    async fn write_log(&self, entry: &LogPayload) -> Result<String, TransportError> {
        let endpoint = Endpoint::from_shared(self.uri.clone())
            .map_err(|e| TransportError::Unreachable(format!("invalid uri {}: {}", self.uri, e)))?
            .connect_timeout(self.deadline)
            .timeout(self.deadline);

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", self.uri, e)))?;

        let request = LogRequest {
            log_entry: Some(Log {
                name: entry.name.clone(),
                data: entry.data.clone(),
            }),
        };
        let response = LogServiceClient::new(channel)
            .write_log(request)
            .await
            .map_err(|status| status_error(&self.uri, status))?;
        Ok(response.into_inner().result)
    }
}

#[async_trait]
impl Adapter for GrpcAdapter {
    fn name(&self) -> &str {
        "grpc"
    }

    fn capability(&self) -> Capability {
        Capability::SyncCall
    }

    async fn invoke(&self, payload: &ActionPayload) -> Result<CanonicalResult, TransportError> {
        let ActionPayload::Log(entry) = payload else {
            return Err(unsupported(self.name(), payload));
        };

        let result = tokio::time::timeout(self.deadline, self.write_log(entry))
            .await
            .map_err(|_| {
                TransportError::Timeout(format!("{} after {:?}", self.uri, self.deadline))
            })??;

        debug!(uri = %self.uri, result = %result, "WriteLog returned");
        Ok(CanonicalResult::success("logged via grpc"))
    }
}

fn status_error(uri: &str, status: Status) -> TransportError {
    match status.code() {
        Code::DeadlineExceeded | Code::Cancelled => {
            TransportError::Timeout(format!("{}: {}", uri, status.message()))
        }
        code => TransportError::Unreachable(format!("{} {:?}: {}", uri, code, status.message())),
    }
}
