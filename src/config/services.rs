//! Downstream service endpoints and per-action transport selection.

use std::time::Duration;

use serde::Deserialize;

use crate::action::Action;
use crate::dispatch::TransportKind;
use crate::transport::HttpEndpoints;

/// Downstream service endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub auth_url: String,
    pub mail_url: String,
    pub logger_url: String,
    /// JSON-RPC logger `host:port`.
    pub rpc_address: String,
    pub rpc_method: String,
    /// gRPC logger `host:port`.
    pub grpc_address: String,
    pub http_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub grpc_deadline_ms: u64,
    /// Bound on one broker publish, declare included.
    pub queue_timeout_ms: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            auth_url: "http://authentication-service/authenticate".to_string(),
            mail_url: "http://mailer-service/send".to_string(),
            logger_url: "http://logger-service/log".to_string(),
            rpc_address: "logger-service:5001".to_string(),
            rpc_method: "RPCServer.LogInfo".to_string(),
            grpc_address: "logger-service:50001".to_string(),
            http_timeout_ms: 5000,
            rpc_timeout_ms: 5000,
            grpc_deadline_ms: 1000,
            queue_timeout_ms: 5000,
        }
    }
}

impl ServicesConfig {
    pub fn http_endpoints(&self) -> HttpEndpoints {
        HttpEndpoints {
            auth: self.auth_url.clone(),
            log: self.logger_url.clone(),
            mail: self.mail_url.clone(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn grpc_deadline(&self) -> Duration {
        Duration::from_millis(self.grpc_deadline_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// Transport per action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
    pub auth: TransportKind,
    pub log: TransportKind,
    pub mail: TransportKind,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            auth: TransportKind::Http,
            log: TransportKind::Queue,
            mail: TransportKind::Http,
        }
    }
}

impl RoutesConfig {
    pub fn kinds(&self) -> [(Action, TransportKind); 3] {
        [
            (Action::Auth, self.auth),
            (Action::Log, self.log),
            (Action::Mail, self.mail),
        ]
    }
}
