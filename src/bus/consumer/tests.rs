use super::*;
use crate::bus::{Emitter, MemoryBroker};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handler that fails its first `failures` calls and reports every call.
struct ScriptedHandler {
    failures: AtomicUsize,
    error: HandlerError,
    calls: AtomicUsize,
    seen: mpsc::UnboundedSender<Envelope>,
}

impl ScriptedHandler {
    fn new(failures: usize, error: HandlerError) -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        let (seen, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            failures: AtomicUsize::new(failures),
            error,
            calls: AtomicUsize::new(0),
            seen,
        });
        (handler, rx)
    }

    fn succeeding() -> (Arc<Self>, mpsc::UnboundedReceiver<Envelope>) {
        Self::new(0, HandlerError::Failed("unused".into()))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnvelopeHandler for ScriptedHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.seen.send(envelope.clone());
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(self.error.clone());
        }
        Ok(())
    }
}

fn patterns() -> Vec<String> {
    vec!["log.*".to_string()]
}

fn spawn_listener(
    broker: &MemoryBroker,
    config: ConsumerConfig,
    handler: Arc<ScriptedHandler>,
) -> (watch::Sender<bool>, JoinHandle<Result<(), ListenError>>) {
    let consumer = Consumer::new(Arc::new(broker.connect()), config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        consumer
            .listen(&patterns(), handler.as_ref(), shutdown_rx)
            .await
    });
    (shutdown_tx, task)
}

/// Declare and bind the named queue up front so publishes made before the
/// consumer subscribes are retained.
async fn prepare_queue(broker: &MemoryBroker, config: &ConsumerConfig) {
    let session = broker.connect().open_session().await.unwrap();
    session.declare_exchange(&config.exchange).await.unwrap();
    if config.failure_policy == FailurePolicy::DeadLetter {
        let dlx = config.dead_letter_exchange();
        session.declare_exchange(&dlx).await.unwrap();
        let dlq = session
            .declare_queue(&QueueSpec::durable(config.dead_letter_queue()))
            .await
            .unwrap();
        session.bind_queue(&dlq, &dlx, "#").await.unwrap();
    }
    let mut spec = QueueSpec::durable(&config.queue);
    if config.failure_policy == FailurePolicy::DeadLetter {
        spec = spec.with_dead_letter_exchange(config.dead_letter_exchange());
    }
    let queue = session.declare_queue(&spec).await.unwrap();
    session.bind_queue(&queue, &config.exchange, "log.*").await.unwrap();
    session.close().await.unwrap();
}

async fn publish(broker: &MemoryBroker, routing_key: &str, body: &str) {
    Emitter::new(Arc::new(broker.connect()), "logs_topic")
        .publish(&Envelope::new(routing_key.to_string(), body.to_string()))
        .await
        .unwrap();
}

fn config() -> ConsumerConfig {
    ConsumerConfig::new("logs_topic")
        .with_queue("logs")
        .with_retry_delay(Duration::from_millis(1))
}

#[test]
fn test_failure_policy_deserializes_snake_case() {
    let policy: FailurePolicy = serde_json::from_str(r#""dead_letter""#).unwrap();
    assert_eq!(policy, FailurePolicy::DeadLetter);
    assert_eq!(FailurePolicy::default(), FailurePolicy::Drop);
}

#[test]
fn test_dead_letter_names() {
    let named = ConsumerConfig::new("logs_topic").with_queue("logs");
    assert_eq!(named.dead_letter_exchange(), "logs_topic.dlx");
    assert_eq!(named.dead_letter_queue(), "logs.dlq");

    let anonymous = ConsumerConfig::new("logs_topic");
    assert_eq!(anonymous.dead_letter_queue(), "logs_topic.dlq");
}

#[tokio::test]
async fn test_delivers_matching_envelope_once_and_acks() {
    let broker = MemoryBroker::new();
    let config = config();
    prepare_queue(&broker, &config).await;
    publish(&broker, "log.INFO", r#"{"name":"test","data":"hello"}"#).await;
    publish(&broker, "mail.REQUEST", "ignored").await;

    let (handler, mut seen) = ScriptedHandler::succeeding();
    let (shutdown, task) = spawn_listener(&broker, config, Arc::clone(&handler));

    let envelope = seen.recv().await.unwrap();
    assert_eq!(envelope.routing_key, "log.INFO");
    assert_eq!(&envelope.body[..], br#"{"name":"test","data":"hello"}"#);

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(handler.calls(), 1);
    assert_eq!(broker.acked().len(), 1);
    assert!(broker.nacked().is_empty());
}

#[tokio::test]
async fn test_processes_in_publish_order() {
    let broker = MemoryBroker::new();
    let config = config();
    prepare_queue(&broker, &config).await;
    for i in 0..5 {
        publish(&broker, "log.INFO", &format!("entry-{}", i)).await;
    }

    let (handler, mut seen) = ScriptedHandler::succeeding();
    let (shutdown, task) = spawn_listener(&broker, config, handler);

    for i in 0..5 {
        let envelope = seen.recv().await.unwrap();
        assert_eq!(envelope.body, format!("entry-{}", i).into_bytes());
    }

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(broker.acked().len(), 5);
}

#[tokio::test]
async fn test_drop_policy_discards_failed_delivery() {
    let broker = MemoryBroker::new();
    let config = config();
    prepare_queue(&broker, &config).await;
    publish(&broker, "log.ERROR", "bad").await;
    publish(&broker, "log.INFO", "good").await;

    let (handler, mut seen) = ScriptedHandler::new(1, HandlerError::Failed("down".into()));
    let (shutdown, task) = spawn_listener(&broker, config, Arc::clone(&handler));

    assert_eq!(seen.recv().await.unwrap().body, "bad".as_bytes());
    assert_eq!(seen.recv().await.unwrap().body, "good".as_bytes());

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(handler.calls(), 2);
    assert_eq!(broker.nacked().len(), 1);
    assert_eq!(broker.acked().len(), 1);
    assert_eq!(broker.queue_depth("logs"), Some(0));
}

#[tokio::test]
async fn test_requeue_policy_redelivers() {
    let broker = MemoryBroker::new();
    let config = config().with_failure_policy(FailurePolicy::Requeue);
    prepare_queue(&broker, &config).await;
    publish(&broker, "log.WARNING", "flaky").await;

    let (handler, mut seen) = ScriptedHandler::new(1, HandlerError::Failed("busy".into()));
    let (shutdown, task) = spawn_listener(&broker, config, Arc::clone(&handler));

    seen.recv().await.unwrap();
    seen.recv().await.unwrap();

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(handler.calls(), 2);
    assert_eq!(broker.nacked().len(), 1);
    assert_eq!(broker.acked().len(), 1);
}

#[tokio::test]
async fn test_dead_letter_policy_routes_to_dlq() {
    let broker = MemoryBroker::new();
    let config = config().with_failure_policy(FailurePolicy::DeadLetter);
    prepare_queue(&broker, &config).await;
    publish(&broker, "log.ERROR", "poison").await;

    let (handler, mut seen) = ScriptedHandler::new(1, HandlerError::Failed("bad entry".into()));
    let (shutdown, task) = spawn_listener(&broker, config, handler);

    seen.recv().await.unwrap();
    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(broker.queue_depth("logs.dlq"), Some(1));
}

#[tokio::test]
async fn test_handler_retried_before_policy() {
    let broker = MemoryBroker::new();
    let config = config().with_handler_retries(2);
    prepare_queue(&broker, &config).await;
    publish(&broker, "log.INFO", "eventually").await;

    let (handler, mut seen) = ScriptedHandler::new(2, HandlerError::Failed("transient".into()));
    let (shutdown, task) = spawn_listener(&broker, config, Arc::clone(&handler));

    for _ in 0..3 {
        seen.recv().await.unwrap();
    }
    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(handler.calls(), 3);
    assert_eq!(broker.acked().len(), 1);
    assert!(broker.nacked().is_empty());
}

#[tokio::test]
async fn test_decode_errors_not_retried() {
    let broker = MemoryBroker::new();
    let config = config().with_handler_retries(3);
    prepare_queue(&broker, &config).await;
    publish(&broker, "log.INFO", "not json").await;
    publish(&broker, "log.INFO", "next").await;

    let (handler, mut seen) = ScriptedHandler::new(1, HandlerError::Decode("expected value".into()));
    let (shutdown, task) = spawn_listener(&broker, config, Arc::clone(&handler));

    seen.recv().await.unwrap();
    seen.recv().await.unwrap();
    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();

    assert_eq!(handler.calls(), 2);
    assert_eq!(broker.nacked().len(), 1);
}

#[tokio::test]
async fn test_anonymous_queue_binds_patterns() {
    let broker = MemoryBroker::new();
    let (handler, mut seen) = ScriptedHandler::succeeding();
    let (shutdown, task) = spawn_listener(&broker, ConsumerConfig::new("logs_topic"), handler);

    // Keep publishing until the consumer has bound its queue
    let envelope = loop {
        publish(&broker, "log.INFO", "late").await;
        tokio::select! {
            envelope = seen.recv() => break envelope.unwrap(),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
    };

    assert_eq!(envelope.routing_key, "log.INFO");
    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connection_loss_ends_listen() {
    let broker = MemoryBroker::new();
    let config = config();
    prepare_queue(&broker, &config).await;
    publish(&broker, "log.INFO", "first").await;

    let (handler, mut seen) = ScriptedHandler::succeeding();
    let (_shutdown, task) = spawn_listener(&broker, config, handler);
    seen.recv().await.unwrap();

    broker.sever_connections();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(ListenError::ConnectionLost(_))));
}

#[tokio::test]
async fn test_listen_on_dead_connection_fails() {
    let broker = MemoryBroker::new();
    let connection = Arc::new(broker.connect());
    broker.sever_connections();
    let (handler, _seen) = ScriptedHandler::succeeding();
    let (_tx, rx) = watch::channel(false);

    let result = Consumer::new(connection, config())
        .listen(&patterns(), handler.as_ref(), rx)
        .await;

    assert!(matches!(result, Err(ListenError::ConnectionLost(_))));
}

#[tokio::test]
async fn test_cancel_before_any_delivery() {
    let broker = MemoryBroker::new();
    let (handler, _seen) = ScriptedHandler::succeeding();
    let (shutdown, task) = spawn_listener(&broker, config(), Arc::clone(&handler));

    shutdown.send(true).unwrap();

    task.await.unwrap().unwrap();
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn test_cancel_during_handler_retries_requeues() {
    let broker = MemoryBroker::new();
    let config = config()
        .with_handler_retries(10)
        .with_retry_delay(Duration::from_secs(60));
    prepare_queue(&broker, &config).await;
    publish(&broker, "log.ERROR", "stuck").await;

    let (handler, mut seen) = ScriptedHandler::new(usize::MAX, HandlerError::Failed("down".into()));
    let (shutdown, task) = spawn_listener(&broker, config, Arc::clone(&handler));

    // First attempt failed; the consumer is now waiting out a retry delay
    seen.recv().await.unwrap();
    shutdown.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("listen should stop without finishing retries");
    result.unwrap().unwrap();

    assert_eq!(handler.calls(), 1);
    assert!(broker.acked().is_empty());
    assert_eq!(broker.nacked().len(), 1);
    assert_eq!(&broker.nacked()[0].body[..], b"stuck");
    assert_eq!(broker.queue_depth("logs"), Some(1));
}
