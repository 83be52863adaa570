//! Worker tests against the in-memory broker
//!
//! These run the full worker loop (connect, consume, route, resolve, close)
//! with `FakeBroker` standing in for RabbitMQ and recording sinks standing in
//! for the storage backends.

use amqp_worker::testing::{FakeBroker, RecordingSink};
use amqp_worker::{
    topology, AmqpWorker, ConnectionState, DecodedEvent, RejectPolicy, Sink, SinkError,
    SinkRouter, WorkerConfig, WorkerError,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

const LINK_REDIRECTED: &str = r#"{"id":"abc","original":"https://example.com","shortened":"https://sho.rt/abc","latency":12,"timestamp":"2024-01-01T00:00:00Z"}"#;

struct Harness {
    broker: FakeBroker,
    points: Arc<RecordingSink>,
    documents: Arc<RecordingSink>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    handle: JoinHandle<Result<(), WorkerError>>,
}

impl Harness {
    fn start(documents: RecordingSink, config: WorkerConfig) -> Self {
        let broker = FakeBroker::with_exchanges(["link", "user"]);
        let points = Arc::new(RecordingSink::named("time_series"));
        let documents = Arc::new(documents);
        let router = SinkRouter::new(documents.clone()).route("link.redirected", points.clone());
        let bindings = topology::resolve(&["link", "user"], &["created", "redirected"]);

        let worker = AmqpWorker::new("test-worker", broker.clone(), bindings, router, config);
        let state = worker.state_receiver();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        Self {
            broker,
            points,
            documents,
            shutdown,
            state,
            handle,
        }
    }

    async fn connected(&mut self) {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .expect("worker did not connect")
        .unwrap();
    }

    async fn stop(self) -> Result<(), WorkerError> {
        self.shutdown.send(true).unwrap();
        self.handle.await.unwrap()
    }

    /// Wait for the worker to exit on its own
    async fn join(self) -> Result<(), WorkerError> {
        let Harness { shutdown, handle, .. } = self;
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not exit")
            .unwrap();
        drop(shutdown);
        result
    }
}

/// Blocks each persist until a permit is released
struct GatedSink {
    gate: Semaphore,
    started: AtomicUsize,
}

impl GatedSink {
    fn closed() -> Self {
        Self {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
        }
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }
}

#[async_trait]
impl Sink for GatedSink {
    async fn persist(&self, _event: &DecodedEvent) -> Result<(), SinkError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| SinkError::unavailable("gate closed"))?;
        permit.forget();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "gated"
    }
}

fn config() -> WorkerConfig {
    WorkerConfig::new()
        .with_consumer_tag("test")
        .with_reconnect(3, Duration::from_millis(50))
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_link_redirect_is_acked_once() {
    let mut harness = Harness::start(RecordingSink::named("document"), config());
    harness.connected().await;

    harness.broker.publish("link", "link.redirected", LINK_REDIRECTED);
    assert!(harness.broker.wait_for_resolutions(1).await);

    assert_eq!(harness.points.events().len(), 1);
    assert!(harness.documents.events().is_empty());
    assert_eq!(harness.broker.acks().len(), 1);
    assert!(harness.broker.rejects().is_empty());

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_json_is_rejected_without_requeue() {
    let mut harness = Harness::start(
        RecordingSink::named("document"),
        config().with_reject_policy(RejectPolicy::RequeueTransient),
    );
    harness.connected().await;

    harness.broker.publish("user", "user.created", "{\"name\":");
    assert!(harness.broker.wait_for_resolutions(1).await);

    let rejects = harness.broker.rejects();
    assert_eq!(rejects.len(), 1);
    assert!(!rejects[0].1);
    assert!(harness.broker.acks().is_empty());
    assert!(harness.points.events().is_empty());
    assert!(harness.documents.events().is_empty());

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_document_sink_failure_is_rejected() {
    let mut harness = Harness::start(
        RecordingSink::failing("document", SinkError::rejected("mapper_parsing_exception")),
        config(),
    );
    harness.connected().await;

    harness.broker.publish("user", "user.created", r#"{"name":"x"}"#);
    assert!(harness.broker.wait_for_resolutions(1).await);

    assert_eq!(harness.broker.rejects().len(), 1);
    assert!(harness.broker.acks().is_empty());

    let attempted = harness.documents.events();
    assert_eq!(attempted.len(), 1);
    assert_eq!(attempted[0].entity, "user");
    assert_eq!(attempted[0].event_type, "created");
    assert!(attempted[0].received_at <= chrono::Utc::now());

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_deliveries_are_processed_in_order() {
    let mut harness = Harness::start(RecordingSink::named("document"), config());
    harness.connected().await;

    for n in 0..5 {
        harness
            .broker
            .publish("user", "user.created", format!(r#"{{"n":{n}}}"#));
    }
    assert!(harness.broker.wait_for_resolutions(5).await);

    let seen: Vec<i64> = harness
        .documents
        .events()
        .iter()
        .filter_map(|e| e.payload.get("n").and_then(|n| n.as_i64()))
        .collect();
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconnects_after_connection_loss() {
    let mut harness = Harness::start(RecordingSink::named("document"), config());
    harness.connected().await;

    harness.broker.drop_connection("CONNECTION_FORCED - broker forced connection closure");

    let broker = harness.broker.clone();
    assert!(eventually(|| broker.open_attempts() == 2 && broker.consumer_tags().len() == 4).await);
    harness.connected().await;

    harness.broker.publish("user", "user.created", r#"{"name":"x"}"#);
    assert!(harness.broker.wait_for_resolutions(1).await);

    let acks = harness.broker.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].generation(), 2);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_fails_when_reconnect_after_loss_is_exhausted() {
    let mut harness = Harness::start(RecordingSink::named("document"), config());
    harness.connected().await;
    let broker = harness.broker.clone();
    let mut state = harness.state.clone();

    broker.fail_all_opens();
    broker.drop_connection("CONNECTION_FORCED - broker forced connection closure");

    let err = harness.join().await.unwrap_err();

    assert!(matches!(err, WorkerError::ReconnectExhausted { attempts: 3, .. }));
    assert!(err.is_fatal());
    // The initial connect plus three attempts after the loss
    assert_eq!(broker.open_attempts(), 4);
    assert_eq!(broker.closed_sessions(), vec![1]);
    assert_eq!(*state.borrow_and_update(), ConnectionState::ShuttingDown);
}

#[tokio::test(start_paused = true)]
async fn test_requeue_is_paced_while_backend_is_down() {
    let mut harness = Harness::start(
        RecordingSink::failing("document", SinkError::unavailable("connection refused")),
        config()
            .with_reject_policy(RejectPolicy::RequeueTransient)
            .with_requeue_delay(Duration::from_secs(1)),
    );
    harness.connected().await;

    let started = tokio::time::Instant::now();
    harness.broker.publish("user", "user.created", r#"{"name":"x"}"#);
    assert!(harness.broker.wait_for_resolutions(3).await);

    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(harness.broker.rejects().iter().all(|(_, requeue)| *requeue));
    assert!(harness.documents.events().len() <= 4);

    harness.stop().await.unwrap();
}

#[tokio::test]
async fn test_unacked_deliveries_never_exceed_prefetch() {
    let broker = FakeBroker::with_exchanges(["user"]);
    let sink = Arc::new(GatedSink::closed());
    let router = SinkRouter::new(sink.clone());
    let bindings = topology::resolve(&["user"], &["created"]);
    let worker = AmqpWorker::new(
        "test-worker",
        broker.clone(),
        bindings,
        router,
        config().with_prefetch(2),
    );
    let mut state = worker.state_receiver();
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(worker.run(rx));
    state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();

    for n in 0..5 {
        broker.publish("user", "user.created", format!(r#"{{"n":{n}}}"#));
    }

    assert!(eventually(|| sink.started() == 1).await);
    assert_eq!(broker.unacked_count(), 2);
    assert_eq!(broker.ready_count("user-created-queue"), 3);

    sink.release(1);
    assert!(broker.wait_for_resolutions(1).await);
    assert!(eventually(|| sink.started() == 2).await);
    assert_eq!(broker.unacked_count(), 2);
    assert_eq!(broker.ready_count("user-created-queue"), 2);

    sink.release(4);
    assert!(broker.wait_for_resolutions(5).await);
    assert_eq!(broker.acks().len(), 5);
    assert_eq!(broker.unacked_count(), 0);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_session() {
    let mut harness = Harness::start(RecordingSink::named("document"), config());
    harness.connected().await;
    let broker = harness.broker.clone();
    let mut state = harness.state.clone();

    harness.stop().await.unwrap();

    assert_eq!(broker.closed_sessions(), vec![1]);
    assert_eq!(*state.borrow_and_update(), ConnectionState::ShuttingDown);
}

#[tokio::test]
async fn test_missing_exchange_is_fatal() {
    let broker = FakeBroker::with_exchanges(["link"]);
    let router = SinkRouter::new(Arc::new(RecordingSink::named("document")));
    let bindings = topology::resolve(&["link", "user"], &["created"]);
    let worker = AmqpWorker::new("test-worker", broker.clone(), bindings, router, config());
    let (_shutdown, shutdown_rx) = watch::channel(false);

    let err = worker.run(shutdown_rx).await.unwrap_err();

    assert!(matches!(err, WorkerError::Topology(_)));
    assert_eq!(broker.open_attempts(), 1);
}

#[tokio::test]
async fn test_no_bindings_is_a_config_error() {
    let broker = FakeBroker::with_exchanges(["link"]);
    let router = SinkRouter::new(Arc::new(RecordingSink::named("document")));
    let worker = AmqpWorker::new("test-worker", broker.clone(), Vec::new(), router, config());
    let (_shutdown, shutdown_rx) = watch::channel(false);

    let err = worker.run(shutdown_rx).await.unwrap_err();

    assert!(matches!(err, WorkerError::Config(_)));
    assert!(err.is_fatal());
    assert_eq!(broker.open_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_three_attempts() {
    let broker = FakeBroker::with_exchanges(["link", "user"]);
    broker.fail_all_opens();
    let router = SinkRouter::new(Arc::new(RecordingSink::named("document")));
    let bindings = topology::resolve(&["link"], &["redirected"]);
    let config = WorkerConfig::new().with_reconnect(3, Duration::from_millis(3000));
    let worker = AmqpWorker::new("test-worker", broker.clone(), bindings, router, config);
    let (_shutdown, shutdown_rx) = watch::channel(false);

    let started = tokio::time::Instant::now();
    let err = worker.run(shutdown_rx).await.unwrap_err();

    assert!(matches!(err, WorkerError::ReconnectExhausted { attempts: 3, .. }));
    assert_eq!(broker.open_attempts(), 3);
    assert_eq!(started.elapsed(), Duration::from_millis(6000));
}

#[tokio::test]
async fn test_messages_published_before_connect_are_delivered() {
    let broker = FakeBroker::with_exchanges(["link", "user"]);
    let documents = Arc::new(RecordingSink::named("document"));
    let router = SinkRouter::new(documents.clone());
    let bindings = topology::resolve(&["user"], &["created"]);

    // Queues and bindings are left behind by a previous run
    let first = AmqpWorker::new("test-worker", broker.clone(), bindings.clone(), router.clone(), config());
    let mut state = first.state_receiver();
    let (stop_first, rx) = watch::channel(false);
    let handle = tokio::spawn(first.run(rx));
    state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
    stop_first.send(true).unwrap();
    handle.await.unwrap().unwrap();

    broker.publish("user", "user.created", "{}");
    assert_eq!(broker.ready_count("user-created-queue"), 1);

    let second = AmqpWorker::new("test-worker", broker.clone(), bindings, router, config());
    let (stop_second, rx) = watch::channel(false);
    let handle = tokio::spawn(second.run(rx));

    assert!(broker.wait_for_resolutions(1).await);
    assert_eq!(documents.events().len(), 1);

    stop_second.send(true).unwrap();
    handle.await.unwrap().unwrap();
}
