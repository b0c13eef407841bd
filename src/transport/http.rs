//! HTTP-forward adapter.
//!
//! POSTs the payload as JSON to the service that owns the action. The
//! services answer `202 Accepted` with a `{error, message, data}` reply;
//! `401` from the auth service is an ordinary failed result.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{Adapter, Capability, TransportError};
use crate::action::{Action, ActionPayload, CanonicalResult};

/// Service URLs per action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpEndpoints {
    pub auth: String,
    pub log: String,
    pub mail: String,
}

impl HttpEndpoints {
    pub fn for_action(&self, action: Action) -> &str {
        match action {
            Action::Auth => &self.auth,
            Action::Log => &self.log,
            Action::Mail => &self.mail,
        }
    }
}

/// Reply document returned by the downstream services.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceReply {
    error: bool,
    message: String,
    data: Option<Value>,
}

pub struct HttpAdapter {
    client: Client,
    endpoints: HttpEndpoints,
}

impl HttpAdapter {
    pub fn new(endpoints: HttpEndpoints, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(format!("failed to build client: {}", e)))?;
        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &HttpEndpoints {
        &self.endpoints
    }

    fn success_message(payload: &ActionPayload) -> String {
        match payload {
            ActionPayload::Auth(_) => "authenticated".to_string(),
            ActionPayload::Log(_) => "logged".to_string(),
            ActionPayload::Mail(mail) => format!("message sent to {}", mail.to),
        }
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    fn name(&self) -> &str {
        "http"
    }

    fn capability(&self) -> Capability {
        Capability::SyncCall
    }

    async fn invoke(&self, payload: &ActionPayload) -> Result<CanonicalResult, TransportError> {
        let url = self.endpoints.for_action(payload.action());

        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| request_error(url, e))?;

        let status = response.status();
        debug!(url = %url, status = %status, "Service responded");

        match status {
            StatusCode::ACCEPTED => {
                let body = response.bytes().await.map_err(|e| request_error(url, e))?;
                // Status is authoritative; an empty or odd body still counts
                let reply: ServiceReply = serde_json::from_slice(&body).unwrap_or_default();
                if reply.error {
                    return Ok(CanonicalResult::failure(reply.message));
                }
                let result = CanonicalResult::success(Self::success_message(payload));
                Ok(match reply.data {
                    Some(data) => result.with_data(data),
                    None => result,
                })
            }
            StatusCode::UNAUTHORIZED => Ok(CanonicalResult::failure("invalid credentials")),
            other => Err(TransportError::RemoteRejected(format!(
                "{} returned {}",
                url, other
            ))),
        }
    }
}

fn request_error(url: &str, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(format!("{}: {}", url, err))
    } else {
        TransportError::Unreachable(format!("{}: {}", url, err))
    }
}
