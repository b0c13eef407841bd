//! Queue-bound consumer.
//!
//! `Consumer::listen` declares the queue, binds every routing-key pattern,
//! then processes deliveries strictly one at a time. A delivery is acked
//! only after its handler succeeds; failures are settled according to the
//! configured `FailurePolicy`. Cancelling mid-delivery stops the handler and
//! its retries and requeues the delivery.
//!
//! A consumer is single-use: `listen` takes `self`, and after a
//! `ListenError` the caller builds a new consumer on a fresh handle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    BrokerConnection, BrokerSession, BusError, Delivery, Envelope, HandlerError, ListenError,
    QueueSpec,
};
use crate::utils::retry::handler_backoff;

/// What to do with a delivery whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Nack without requeue; the message is discarded.
    #[default]
    Drop,
    /// Nack with requeue; the broker redelivers.
    Requeue,
    /// Nack without requeue into a dead-letter exchange and queue.
    DeadLetter,
}

/// Consumer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Topic exchange to bind to.
    pub exchange: String,
    /// Queue name. Empty means a broker-named exclusive queue.
    pub queue: String,
    pub failure_policy: FailurePolicy,
    /// Extra handler attempts before the failure policy applies.
    pub handler_retries: usize,
    pub retry_delay: Duration,
    pub prefetch: u16,
}

impl ConsumerConfig {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: String::new(),
            failure_policy: FailurePolicy::Drop,
            handler_retries: 0,
            retry_delay: Duration::from_millis(100),
            prefetch: 1,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_handler_retries(mut self, retries: usize) -> Self {
        self.handler_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.dlx", self.exchange)
    }

    /// Dead-letter queue name.
    ///
    /// Broker-named queues are recreated per connection, so their dead
    /// letters collect under the exchange name instead.
    pub fn dead_letter_queue(&self) -> String {
        if self.queue.is_empty() {
            format!("{}.dlq", self.exchange)
        } else {
            format!("{}.dlq", self.queue)
        }
    }
}

/// Processes envelopes delivered to a consumer.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T: EnvelopeHandler + ?Sized> EnvelopeHandler for Arc<T> {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        (**self).handle(envelope).await
    }
}

/// Consumes one queue over a borrowed connection.
pub struct Consumer {
    connection: Arc<dyn BrokerConnection>,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(connection: Arc<dyn BrokerConnection>, config: ConsumerConfig) -> Self {
        Self { connection, config }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Bind `patterns` and process deliveries until cancelled or the
    /// connection drops.
    ///
    /// Returns `Ok(())` once `shutdown` flips to `true`. Any other return is
    /// a `ListenError`.
    pub async fn listen<H>(
        self,
        patterns: &[String],
        handler: &H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ListenError>
    where
        H: EnvelopeHandler + ?Sized,
    {
        let session = self.connection.open_session().await?;

        let outcome = self
            .run(session.as_ref(), patterns, handler, &mut shutdown)
            .await;

        if let Err(e) = session.close().await {
            debug!(error = %e, "Failed to close consumer session");
        }
        outcome
    }

    async fn run<H>(
        &self,
        session: &dyn BrokerSession,
        patterns: &[String],
        handler: &H,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ListenError>
    where
        H: EnvelopeHandler + ?Sized,
    {
        let queue = self.subscribe(session, patterns).await?;
        let mut deliveries = session.consume(&queue).await?;

        info!(
            exchange = %self.config.exchange,
            queue = %queue,
            patterns = ?patterns,
            failure_policy = ?self.config.failure_policy,
            "Consumer listening"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancelled(shutdown) => {
                    info!(queue = %queue, "Consumer cancelled");
                    return Ok(());
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let processed = self.process(delivery, handler, shutdown).await?;
                        if processed == Processed::Interrupted {
                            info!(queue = %queue, "Consumer cancelled");
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(ListenError::ConnectionLost(format!(
                            "delivery stream for '{}' ended",
                            queue
                        )))
                    }
                },
            }
        }
    }

    /// Declare exchange and queue, then bind every pattern.
    async fn subscribe(
        &self,
        session: &dyn BrokerSession,
        patterns: &[String],
    ) -> Result<String, BusError> {
        let config = &self.config;
        session.declare_exchange(&config.exchange).await?;

        let mut spec = if config.queue.is_empty() {
            QueueSpec::anonymous()
        } else {
            QueueSpec::durable(&config.queue)
        };

        if config.failure_policy == FailurePolicy::DeadLetter {
            let dlx = config.dead_letter_exchange();
            session.declare_exchange(&dlx).await?;
            let dlq = session
                .declare_queue(&QueueSpec::durable(config.dead_letter_queue()))
                .await?;
            session.bind_queue(&dlq, &dlx, "#").await?;
            spec = spec.with_dead_letter_exchange(dlx);
        }

        let queue = session.declare_queue(&spec).await?;
        for pattern in patterns {
            session.bind_queue(&queue, &config.exchange, pattern).await?;
        }
        session.set_prefetch(config.prefetch).await?;
        Ok(queue)
    }

    async fn process<H>(
        &self,
        delivery: Delivery,
        handler: &H,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Processed, ListenError>
    where
        H: EnvelopeHandler + ?Sized,
    {
        let envelope = &delivery.envelope;

        let handled = tokio::select! {
            biased;
            _ = cancelled(shutdown) => None,
            result = self.handle_with_retries(handler, envelope) => Some(result),
        };

        let (settled, processed) = match handled {
            None => {
                info!(
                    routing_key = %envelope.routing_key,
                    "Cancelled while handling, requeueing delivery"
                );
                (delivery.nack(true).await, Processed::Interrupted)
            }
            Some(Ok(())) => {
                debug!(routing_key = %envelope.routing_key, "Handled delivery, acking");
                (delivery.ack().await, Processed::Settled)
            }
            Some(Err(e)) => {
                let requeue = self.config.failure_policy == FailurePolicy::Requeue;
                warn!(
                    routing_key = %envelope.routing_key,
                    redelivered = delivery.redelivered,
                    failure_policy = ?self.config.failure_policy,
                    error = %e,
                    "Handler failed, nacking delivery"
                );
                (delivery.nack(requeue).await, Processed::Settled)
            }
        };

        match settled {
            Err(e) if e.is_connection_lost() => Err(e.into()),
            Err(e) => {
                warn!(routing_key = %envelope.routing_key, error = %e, "Failed to settle delivery");
                Ok(processed)
            }
            Ok(()) => Ok(processed),
        }
    }

    async fn handle_with_retries<H>(&self, handler: &H, envelope: &Envelope) -> Result<(), HandlerError>
    where
        H: EnvelopeHandler + ?Sized,
    {
        if self.config.handler_retries == 0 {
            return handler.handle(envelope).await;
        }

        (|| async { handler.handle(envelope).await })
            .retry(handler_backoff(self.config.retry_delay, self.config.handler_retries))
            .sleep(tokio::time::sleep)
            .when(|e| !matches!(e, HandlerError::Decode(_)))
            .notify(|e: &HandlerError, delay: Duration| {
                warn!(
                    routing_key = %envelope.routing_key,
                    error = %e,
                    delay = ?delay,
                    "Handler failed, retrying"
                );
            })
            .await
    }
}

/// How `process` left a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    /// Acked or nacked per the handler outcome.
    Settled,
    /// Shutdown arrived first; requeued untouched by the failure policy.
    Interrupted,
}

/// Resolves once `shutdown` reads `true`. Never resolves if the sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests;
