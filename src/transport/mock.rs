//! Mock adapter for testing.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Adapter, Capability, TransportError};
use crate::action::{ActionPayload, CanonicalResult};

/// Adapter double with a scripted outcome and a call log.
pub struct MockAdapter {
    name: String,
    capability: Capability,
    outcome: RwLock<Result<CanonicalResult, TransportError>>,
    calls: AtomicUsize,
    payloads: RwLock<Vec<ActionPayload>>,
}

impl MockAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability: Capability::SyncCall,
            outcome: RwLock::new(Ok(CanonicalResult::success("ok"))),
            calls: AtomicUsize::new(0),
            payloads: RwLock::new(Vec::new()),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    pub async fn set_outcome(&self, outcome: Result<CanonicalResult, TransportError>) {
        *self.outcome.write().await = outcome;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn take_payloads(&self) -> Vec<ActionPayload> {
        std::mem::take(&mut *self.payloads.write().await)
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    async fn invoke(&self, payload: &ActionPayload) -> Result<CanonicalResult, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.write().await.push(payload.clone());
        self.outcome.read().await.clone()
    }
}
