//! Message broker fabric for the asynchronous path.
//!
//! This module contains:
//! - `Envelope`: routing key plus opaque body, the unit exchanged with the broker
//! - `BrokerConnection` / `BrokerSession`: the seam between emitter/consumer
//!   logic and a concrete broker client
//! - `Emitter`: publish to a topic exchange
//! - `Consumer`: bind patterns to a queue and process deliveries in order
//! - Implementations: AMQP (RabbitMQ), in-memory

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod consumer;
pub mod emitter;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpConnection, AmqpConnector};
pub use consumer::{Consumer, ConsumerConfig, EnvelopeHandler, FailurePolicy};
pub use emitter::Emitter;
pub use memory::{MemoryBroker, MemoryConnection, MemoryConnector};

/// Result type for broker session operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors raised by broker sessions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Declare failed: {0}")]
    Declare(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),
}

impl BusError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BusError::ConnectionLost(_))
    }
}

/// Errors surfaced by `Emitter::publish`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    /// The connection is unusable; the caller must reconnect before retrying.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("publish failed: {0}")]
    Failed(String),
}

impl From<BusError> for PublishError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::ConnectionLost(msg) => PublishError::ConnectionLost(msg),
            other => PublishError::Failed(other.to_string()),
        }
    }
}

/// Errors that end `Consumer::listen`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ListenError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("subscription setup failed: {0}")]
    Setup(String),
}

impl From<BusError> for ListenError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::ConnectionLost(msg) => ListenError::ConnectionLost(msg),
            other => ListenError::Setup(other.to_string()),
        }
    }
}

/// Errors returned by envelope handlers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("failed to decode envelope: {0}")]
    Decode(String),

    #[error("handler failed: {0}")]
    Failed(String),
}

/// Routing key plus opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub routing_key: String,
    pub body: Bytes,
}

impl Envelope {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
        }
    }

    /// Build an envelope with a JSON-encoded body.
    pub fn json<T: Serialize>(routing_key: impl Into<String>, value: &T) -> serde_json::Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(routing_key, body))
    }

    /// Decode the body as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> std::result::Result<T, HandlerError> {
        serde_json::from_slice(&self.body).map_err(|e| HandlerError::Decode(e.to_string()))
    }
}

/// Queue declaration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name; empty asks the broker to generate one.
    pub name: String,
    pub durable: bool,
    /// Exclusive to this connection and deleted with it.
    pub exclusive: bool,
    /// Exchange receiving messages nacked without requeue.
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// Broker-named, exclusive, auto-deleted queue.
    pub fn anonymous() -> Self {
        Self {
            exclusive: true,
            ..Default::default()
        }
    }

    /// Named durable queue shared by consumer instances.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            ..Default::default()
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message delivered to a consumer, pending acknowledgement.
pub struct Delivery {
    pub envelope: Envelope,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(envelope: Envelope, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

/// Stream of deliveries from one queue. Ends with an error when the
/// connection drops.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A live broker connection, shared read-only by emitters and consumers.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a transient channel on this connection.
    async fn open_session(&self) -> Result<Box<dyn BrokerSession>>;

    fn is_connected(&self) -> bool;
}

/// A channel on a broker connection.
///
/// Exchanges are always topic exchanges.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare a topic exchange. Declaring an existing exchange is a no-op.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()>;

    /// Declare a queue and return its (possibly broker-generated) name.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    /// Limit unacknowledged deliveries in flight on this session.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

/// Topic-exchange routing key match.
///
/// Words are dot-separated; `*` matches exactly one word, `#` matches zero
/// or more words.
pub fn routing_key_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}
