//! Topic publisher.
//!
//! Each publish runs on its own transient session: open, declare the
//! exchange, publish, close. The session is closed on every exit path. The
//! emitter never reconnects or retries; a `ConnectionLost` goes back to the
//! caller, who owns the lifecycle manager.

use std::sync::Arc;

use tracing::{debug, warn};

use super::{BrokerConnection, BrokerSession, Envelope, PublishError, Result};

/// Publishes envelopes to one topic exchange over a borrowed connection.
#[derive(Clone)]
pub struct Emitter {
    connection: Arc<dyn BrokerConnection>,
    exchange: String,
}

impl Emitter {
    pub fn new(connection: Arc<dyn BrokerConnection>, exchange: impl Into<String>) -> Self {
        Self {
            connection,
            exchange: exchange.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    #[tracing::instrument(
        name = "emitter.publish",
        skip_all,
        fields(exchange = %self.exchange, routing_key = %envelope.routing_key)
    )]
    pub async fn publish(&self, envelope: &Envelope) -> std::result::Result<(), PublishError> {
        let session = self.connection.open_session().await?;

        let outcome = declare_and_publish(session.as_ref(), &self.exchange, envelope).await;

        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close publish session");
        }

        outcome?;
        debug!(bytes = envelope.body.len(), "Published envelope");
        Ok(())
    }
}

async fn declare_and_publish(
    session: &dyn BrokerSession,
    exchange: &str,
    envelope: &Envelope,
) -> Result<()> {
    session.declare_exchange(exchange).await?;
    session.publish(exchange, envelope).await
}
