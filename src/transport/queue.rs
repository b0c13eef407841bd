//! Async-publish adapter.
//!
//! Turns the payload into an envelope and hands it to an `Emitter` on the
//! lifecycle manager's current connection. Success means accepted for
//! delivery, which the result message states. The whole publish is bounded
//! by the adapter timeout; a broker holding publishers back surfaces as
//! `TransportError::Timeout`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{Adapter, Capability, TransportError};
use crate::action::{ActionPayload, CanonicalResult};
use crate::bus::{BrokerConnection, Emitter, Envelope, PublishError};
use crate::lifecycle::{Connector, LifecycleManager};

/// Routing key for a payload: `log.{SEVERITY}` for log entries,
/// `{action}.REQUEST` otherwise.
pub fn routing_key(payload: &ActionPayload) -> String {
    match payload {
        ActionPayload::Log(entry) => format!("log.{}", entry.level.as_str()),
        other => format!("{}.REQUEST", other.action()),
    }
}

/// Envelope carrying `payload` as its JSON body.
pub fn envelope_for(payload: &ActionPayload) -> Result<Envelope, TransportError> {
    Envelope::json(routing_key(payload), payload).map_err(|e| TransportError::Encoding(e.to_string()))
}

fn accepted_message(payload: &ActionPayload) -> String {
    match payload {
        ActionPayload::Log(_) => "logged via message queue".to_string(),
        other => format!("{} accepted via message queue", other.action()),
    }
}

pub struct QueueAdapter<C: Connector> {
    manager: Arc<LifecycleManager<C>>,
    exchange: String,
    timeout: Duration,
}

impl<C> QueueAdapter<C>
where
    C: Connector,
    C::Handle: BrokerConnection,
{
    pub fn new(
        manager: Arc<LifecycleManager<C>>,
        exchange: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            manager,
            exchange: exchange.into(),
            timeout,
        }
    }
}

#[async_trait]
impl<C> Adapter for QueueAdapter<C>
where
    C: Connector,
    C::Handle: BrokerConnection,
{
    fn name(&self) -> &str {
        "queue"
    }

    fn capability(&self) -> Capability {
        Capability::AsyncPublish
    }

    async fn invoke(&self, payload: &ActionPayload) -> Result<CanonicalResult, TransportError> {
        let envelope = envelope_for(payload)?;
        let handle = self
            .manager
            .current()
            .await
            .ok_or_else(|| TransportError::Unreachable("broker not connected".to_string()))?;

        let connection: Arc<dyn BrokerConnection> = handle.clone();
        let emitter = Emitter::new(connection, self.exchange.as_str());

        let outcome = tokio::time::timeout(self.timeout, emitter.publish(&envelope))
            .await
            .map_err(|_| {
                warn!(exchange = %self.exchange, timeout = ?self.timeout, "Publish timed out");
                TransportError::Timeout(format!(
                    "publish to {} after {:?}",
                    self.exchange, self.timeout
                ))
            })?;

        match outcome {
            Ok(()) => Ok(CanonicalResult::success(accepted_message(payload))),
            Err(PublishError::ConnectionLost(reason)) => {
                warn!(exchange = %self.exchange, reason = %reason, "Broker connection lost during publish");
                self.manager.report_lost(&handle).await;
                Err(TransportError::Unreachable(reason))
            }
            Err(PublishError::Failed(reason)) => Err(TransportError::RemoteRejected(reason)),
        }
    }
}
