//! Action dispatch.
//!
//! The `Dispatcher` validates a canonical request, looks its action up in a
//! `RouteTable` built once at startup, and invokes exactly one adapter.
//! Transport failures come back as `success=false` results; the dispatcher
//! never retries.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::action::{Action, CanonicalRequest, CanonicalResult, ValidationError};
use crate::transport::Adapter;

/// Errors that stop a request before any adapter runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Unknown action, an action with no route, or a payload that does not
    /// belong to the declared action.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid request: {0}")]
    Invalid(ValidationError),
}

impl From<ValidationError> for DispatchError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::UnknownAction(action) => DispatchError::UnknownAction(action),
            ValidationError::PayloadMismatch { action, payload } => {
                DispatchError::UnknownAction(format!("{} with a {} payload", action, payload))
            }
            other => DispatchError::Invalid(other),
        }
    }
}

/// Transport selectable per action in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Rpc,
    Grpc,
    Queue,
}

impl TransportKind {
    /// Whether this transport has a remote endpoint for `action`.
    pub fn supports(&self, action: Action) -> bool {
        match self {
            TransportKind::Http | TransportKind::Queue => true,
            TransportKind::Rpc | TransportKind::Grpc => action == Action::Log,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Rpc => "rpc",
            TransportKind::Grpc => "grpc",
            TransportKind::Queue => "queue",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors building a route table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("no {kind} adapter available for action '{action}'")]
    MissingAdapter { action: Action, kind: TransportKind },

    #[error("{kind} transport cannot carry action '{action}'")]
    Unsupported { action: Action, kind: TransportKind },
}

/// Action → adapter mapping. Built once, read-only afterwards.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: HashMap<Action, Arc<dyn Adapter>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, action: Action, adapter: Arc<dyn Adapter>) -> Self {
        self.routes.insert(action, adapter);
        self
    }

    /// Resolve configured transport kinds against the available adapters.
    pub fn from_kinds(
        kinds: &[(Action, TransportKind)],
        adapters: &HashMap<TransportKind, Arc<dyn Adapter>>,
    ) -> Result<Self, RouteError> {
        let mut table = Self::new();
        for &(action, kind) in kinds {
            if !kind.supports(action) {
                return Err(RouteError::Unsupported { action, kind });
            }
            let adapter = adapters
                .get(&kind)
                .ok_or(RouteError::MissingAdapter { action, kind })?;
            table.routes.insert(action, Arc::clone(adapter));
        }
        Ok(table)
    }

    pub fn get(&self, action: Action) -> Option<&Arc<dyn Adapter>> {
        self.routes.get(&action)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for action in Action::ALL {
            if let Some(adapter) = self.routes.get(&action) {
                map.entry(&action.as_str(), &adapter.name());
            }
        }
        map.finish()
    }
}

/// Routes canonical requests to adapters.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    routes: RouteTable,
}

impl Dispatcher {
    pub fn new(routes: RouteTable) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Dispatch a request to the adapter routed for its action.
    #[tracing::instrument(name = "dispatch", skip_all, fields(action = %request.action))]
    pub async fn dispatch(&self, request: &CanonicalRequest) -> Result<CanonicalResult, DispatchError> {
        request.validate()?;

        let adapter = self
            .routes
            .get(request.action)
            .ok_or_else(|| DispatchError::UnknownAction(request.action.to_string()))?;

        match adapter.invoke(&request.payload).await {
            Ok(result) => {
                info!(
                    adapter = %adapter.name(),
                    capability = ?adapter.capability(),
                    success = result.success,
                    "Dispatched"
                );
                Ok(result)
            }
            Err(e) => {
                warn!(adapter = %adapter.name(), error = %e, "Transport failed");
                Ok(CanonicalResult::failure(e.to_string()))
            }
        }
    }

    /// Parse an inbound JSON document and dispatch it.
    pub async fn dispatch_json(&self, body: &[u8]) -> Result<CanonicalResult, DispatchError> {
        let request = CanonicalRequest::from_json(body)?;
        self.dispatch(&request).await
    }
}
