//! Listener: consume log envelopes and forward them to the logger service.
//!
//! `LogForwarder` decodes each envelope body as a log entry and invokes an
//! adapter (HTTP-forward in production). `run_listener` keeps a consumer
//! alive across broker reconnects until shutdown.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::action::{ActionPayload, LogPayload};
use crate::bus::{
    BrokerConnection, Consumer, ConsumerConfig, Envelope, EnvelopeHandler, HandlerError,
    ListenError,
};
use crate::lifecycle::{ConnectionError, Connector, LifecycleManager};
use crate::transport::Adapter;

/// Errors that stop the listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Listen(#[from] ListenError),
}

/// Forwards log envelopes to the logger through an adapter.
pub struct LogForwarder {
    adapter: Arc<dyn Adapter>,
}

impl LogForwarder {
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait]
impl EnvelopeHandler for LogForwarder {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let entry: LogPayload = envelope.decode_json()?;
        debug!(routing_key = %envelope.routing_key, name = %entry.name, "Forwarding log entry");

        match self.adapter.invoke(&ActionPayload::Log(entry)).await {
            Ok(result) if result.success => Ok(()),
            Ok(result) => Err(HandlerError::Failed(result.message)),
            Err(e) => Err(HandlerError::Failed(e.to_string())),
        }
    }
}

/// Consume `patterns` with `handler`, rebuilding the consumer on a fresh
/// handle whenever the connection drops.
///
/// Returns `Ok(())` on shutdown. Setup failures and an exhausted reconnect
/// are returned as errors.
pub async fn run_listener<C, H>(
    manager: &LifecycleManager<C>,
    config: &ConsumerConfig,
    patterns: &[String],
    handler: &H,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ListenerError>
where
    C: Connector,
    C::Handle: BrokerConnection,
    H: EnvelopeHandler + ?Sized,
{
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let handle = manager.reconnect().await?;
        let connection: Arc<dyn BrokerConnection> = handle.clone();
        let consumer = Consumer::new(connection, config.clone());

        match consumer.listen(patterns, handler, shutdown.clone()).await {
            Ok(()) => {
                info!("Listener stopped");
                return Ok(());
            }
            Err(ListenError::ConnectionLost(reason)) => {
                warn!(reason = %reason, "Consumer lost its connection, reconnecting");
                manager.report_lost(&handle).await;
            }
            Err(e) => {
                error!(error = %e, "Consumer setup failed");
                return Err(e.into());
            }
        }
    }
}
