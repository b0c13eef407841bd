//! In-memory topic broker.
//!
//! Implements the broker seam with AMQP topic-exchange semantics inside a
//! single process: exchanges, queues, pattern bindings, ack/nack with
//! requeue and dead-letter routing. Used for local runs and as the broker
//! double in tests. `sever_connections` simulates a dropped broker.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::{
    routing_key_matches, Acknowledger, BrokerConnection, BrokerSession, BusError, Delivery,
    DeliveryStream, Envelope, QueueSpec, Result,
};
use crate::lifecycle::{ConnectionTarget, Connector, ConnectorError};

struct QueuedMessage {
    envelope: Envelope,
    redelivered: bool,
}

struct QueueState {
    tx: mpsc::UnboundedSender<QueuedMessage>,
    /// Taken by the active consumer, returned when its stream is dropped.
    rx: Option<mpsc::UnboundedReceiver<QueuedMessage>>,
    dead_letter_exchange: Option<String>,
    /// Connection that owns an exclusive queue.
    owner: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    exchange_declarations: usize,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, watch::Sender<bool>>,
    published: Vec<(String, Envelope)>,
    acked: Vec<Envelope>,
    nacked: Vec<Envelope>,
    open_sessions: usize,
    fail_publish: bool,
    stall_publish: bool,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    next_connection: AtomicU64,
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test panicked mid-operation
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a new connection to this broker.
    pub fn connect(&self) -> MemoryConnection {
        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        let (alive_tx, alive_rx) = watch::channel(true);
        self.state().connections.insert(id, alive_tx);
        debug!(connection = id, "Memory broker connection opened");
        MemoryConnection {
            broker: self.clone(),
            id,
            alive: alive_rx,
        }
    }

    /// Drop every open connection, ending active consumers with
    /// `ConnectionLost` and deleting exclusive queues.
    pub fn sever_connections(&self) {
        let mut state = self.state();
        for (_, alive) in state.connections.drain() {
            alive.send_replace(false);
        }
        let exclusive: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &exclusive {
            state.queues.remove(name);
        }
        state.bindings.retain(|b| !exclusive.contains(&b.queue));
        info!("Memory broker severed all connections");
    }

    /// Make every publish fail until cleared.
    pub fn set_fail_publish(&self, fail: bool) {
        self.state().fail_publish = fail;
    }

    /// Make every publish pend until the caller gives up, like a broker
    /// holding publishers under flow control.
    pub fn set_stall_publish(&self, stall: bool) {
        self.state().stall_publish = stall;
    }

    /// Everything published so far, as (exchange, envelope).
    pub fn published(&self) -> Vec<(String, Envelope)> {
        self.state().published.clone()
    }

    pub fn acked(&self) -> Vec<Envelope> {
        self.state().acked.clone()
    }

    pub fn nacked(&self) -> Vec<Envelope> {
        self.state().nacked.clone()
    }

    pub fn exchange_declarations(&self) -> usize {
        self.state().exchange_declarations
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state().exchanges.contains(exchange)
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.state().open_sessions
    }

    /// Messages waiting in `queue` that no consumer has taken.
    ///
    /// Only meaningful while no consumer is attached.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state()
            .queues
            .get(queue)
            .and_then(|q| q.rx.as_ref().map(|rx| rx.len()))
    }

    fn route(state: &mut BrokerState, exchange: &str, envelope: &Envelope) -> Result<usize> {
        if !state.exchanges.contains(exchange) {
            return Err(BusError::Publish(format!(
                "no exchange '{}' declared",
                exchange
            )));
        }

        let mut targets: Vec<String> = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.exchange == exchange) {
            if routing_key_matches(&binding.pattern, &envelope.routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }

        for queue in &targets {
            if let Some(q) = state.queues.get(queue) {
                let _ = q.tx.send(QueuedMessage {
                    envelope: envelope.clone(),
                    redelivered: false,
                });
            }
        }
        Ok(targets.len())
    }

    fn return_receiver(&self, queue: &str, rx: mpsc::UnboundedReceiver<QueuedMessage>) {
        if let Some(q) = self.state().queues.get_mut(queue) {
            q.rx = Some(rx);
        }
    }
}

/// A connection to a `MemoryBroker`.
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    alive: watch::Receiver<bool>,
}

impl MemoryConnection {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_session(&self) -> Result<Box<dyn BrokerSession>> {
        if !self.is_connected() {
            return Err(BusError::ConnectionLost(format!(
                "memory connection {} closed",
                self.id
            )));
        }
        self.broker.state().open_sessions += 1;
        Ok(Box::new(MemorySession {
            broker: self.broker.clone(),
            connection: self.id,
            alive: self.alive.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn is_connected(&self) -> bool {
        *self.alive.borrow()
    }
}

struct MemorySession {
    broker: MemoryBroker,
    connection: u64,
    alive: watch::Receiver<bool>,
    closed: AtomicBool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<()> {
        if !*self.alive.borrow() {
            return Err(BusError::ConnectionLost(format!(
                "memory connection {} closed",
                self.connection
            )));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Declare("session already closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state.exchange_declarations += 1;
        state.exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: &Envelope) -> Result<()> {
        self.ensure_open()?;
        let stalled = self.broker.state().stall_publish;
        if stalled {
            std::future::pending::<()>().await;
        }
        let mut state = self.broker.state();
        if state.fail_publish {
            return Err(BusError::Publish("injected publish failure".to_string()));
        }
        let routed = MemoryBroker::route(&mut state, exchange, envelope)?;
        state
            .published
            .push((exchange.to_string(), envelope.clone()));
        debug!(
            exchange = %exchange,
            routing_key = %envelope.routing_key,
            queues = routed,
            "Published envelope"
        );
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        self.ensure_open()?;
        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4())
        } else {
            spec.name.clone()
        };

        let mut state = self.broker.state();
        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != self.connection) {
                return Err(BusError::Declare(format!(
                    "queue '{}' is exclusive to another connection",
                    name
                )));
            }
            return Ok(name);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.queues.insert(
            name.clone(),
            QueueState {
                tx,
                rx: Some(rx),
                dead_letter_exchange: spec.dead_letter_exchange.clone(),
                owner: spec.exclusive.then_some(self.connection),
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !state.exchanges.contains(exchange) {
            return Err(BusError::Subscribe(format!(
                "no exchange '{}' declared",
                exchange
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::Subscribe(format!("no queue '{}' declared", queue)));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        // Deliveries are handed out one stream item at a time already
        self.ensure_open()
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let rx = {
            let mut state = self.broker.state();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::Subscribe(format!("no queue '{}' declared", queue)))?;
            q.rx
                .take()
                .ok_or_else(|| BusError::Subscribe(format!("queue '{}' already consumed", queue)))?
        };

        let slot = ConsumerSlot {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            rx: Some(rx),
            alive: self.alive.clone(),
            finished: false,
        };

        let stream = futures::stream::unfold(slot, |mut slot| async move {
            let item = slot.next_delivery().await?;
            Some((item, slot))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.broker.state();
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
        Ok(())
    }
}

/// Holds a queue's receiver for one consumer and hands it back on drop.
struct ConsumerSlot {
    broker: MemoryBroker,
    queue: String,
    rx: Option<mpsc::UnboundedReceiver<QueuedMessage>>,
    alive: watch::Receiver<bool>,
    finished: bool,
}

impl ConsumerSlot {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        if self.finished {
            return None;
        }
        let rx = self.rx.as_mut()?;

        tokio::select! {
            message = rx.recv() => {
                let message = message?;
                let acker = MemoryAcker {
                    broker: self.broker.clone(),
                    queue: self.queue.clone(),
                    envelope: message.envelope.clone(),
                    settled: AtomicBool::new(false),
                };
                Some(Ok(Delivery::new(message.envelope, message.redelivered, Box::new(acker))))
            }
            _ = wait_closed(&mut self.alive) => {
                self.finished = true;
                Some(Err(BusError::ConnectionLost(format!(
                    "consumer on '{}' lost its connection",
                    self.queue
                ))))
            }
        }
    }
}

impl Drop for ConsumerSlot {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.broker.return_receiver(&self.queue, rx);
        }
    }
}

async fn wait_closed(alive: &mut watch::Receiver<bool>) {
    while *alive.borrow_and_update() {
        if alive.changed().await.is_err() {
            return;
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    envelope: Envelope,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BusError::Acknowledge("delivery already settled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.broker.state().acked.push(self.envelope.clone());
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        let mut state = self.broker.state();
        state.nacked.push(self.envelope.clone());

        let Some(queue) = state.queues.get(&self.queue) else {
            return Ok(());
        };

        if requeue {
            let _ = queue.tx.send(QueuedMessage {
                envelope: self.envelope.clone(),
                redelivered: true,
            });
        } else if let Some(dlx) = queue.dead_letter_exchange.clone() {
            MemoryBroker::route(&mut state, &dlx, &self.envelope)?;
        }
        Ok(())
    }
}

/// Connector for the lifecycle manager that opens `MemoryConnection`s.
///
/// Can be scripted to refuse the first N handshakes.
pub struct MemoryConnector {
    broker: MemoryBroker,
    refusals: AtomicU32,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            refusals: AtomicU32::new(0),
        }
    }

    pub fn refusing_first(broker: MemoryBroker, refusals: u32) -> Self {
        Self {
            broker,
            refusals: AtomicU32::new(refusals),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Handle = MemoryConnection;

    async fn handshake(&self, target: &ConnectionTarget) -> std::result::Result<MemoryConnection, ConnectorError> {
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(format!("{} refused connection", target.name).into());
        }
        Ok(self.broker.connect())
    }
}
