use crate::config::EngineConfig;
use crate::correlation::{
    confirm_pair, BatchProxyCorrelationKey, CorrelationKey, ErrorRoutingCorrelationKey,
    PublishErrorReport, PublishErrorSink,
};
use crate::dispatch::{scan_in_flight, DispatchStats, InFlightRecord, ProcessingErrorHandler};
use crate::error::ClientError;
use crate::error_queue::{
    error_queue_name, ErrorMessageHandler, ErrorQueueInfrastructure, ATTEMPTS_HEADER,
    SOURCE_ENDPOINT_HEADER,
};
use crate::flow::FlowReceiverContainer;
use crate::health::{FlowHealthListener, HealthSink, TracingHealthSink};
use crate::publish::{
    DeliveryMode, PublishRequest, PublisherOptions, TransactionalPublisher,
    TARGET_DESTINATION_HEADER,
};
use crate::reconnect::ReconnectTaskRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serial_test::serial;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_transport::inmemory::InMemoryTransport;
use tether_transport::{
    ChannelConfig, Destination, EndpointDescriptor, FlowEvent, FlowEventListener,
    OutboundMessage, ProducerChannel, ReceiveChannel, SessionEvent, TransactedProducer, Transport,
    TransportError,
};

fn new_flow(transport: &InMemoryTransport, endpoint: &str) -> Arc<FlowReceiverContainer> {
    let sink = Arc::new(TracingHealthSink::new(endpoint));
    let events = Arc::new(FlowHealthListener::new(endpoint, sink));
    Arc::new(FlowReceiverContainer::new(
        Arc::new(transport.clone()),
        EndpointDescriptor::new(endpoint),
        events,
    ))
}

// ---------------------------------------------------------------------------
// Flow receiver container
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bind_is_idempotent() {
    let transport = InMemoryTransport::new();
    let flow = new_flow(&transport, "orders");
    let first = flow.bind().await.expect("bind");
    let second = flow.bind().await.expect("second bind");
    assert_eq!(first, second);
    assert!(flow.is_bound());
}

#[tokio::test]
async fn rebind_mints_a_new_generation() {
    let transport = InMemoryTransport::new();
    let flow = new_flow(&transport, "orders");
    let first = flow.bind().await.expect("bind");
    let second = flow.rebind().await.expect("rebind");
    assert_ne!(first, second);
}

#[tokio::test]
async fn receive_unbound_is_an_error() {
    let transport = InMemoryTransport::new();
    let flow = new_flow(&transport, "orders");
    let err = flow
        .receive(Some(Duration::ZERO))
        .await
        .expect_err("must fail unbound");
    assert!(matches!(err, ClientError::NotBound(_)));
}

#[tokio::test]
async fn settlement_is_applied_at_most_once() {
    let transport = InMemoryTransport::new();
    transport.seed("orders", Bytes::from_static(b"one"));
    let flow = new_flow(&transport, "orders");
    flow.bind().await.expect("bind");
    let container = flow
        .receive(Some(Duration::from_secs(1)))
        .await
        .expect("receive")
        .expect("message");
    flow.acknowledge(&container).await.expect("first settle");
    assert!(container.is_acknowledged());
    // Second and third settlements are no-ops, regardless of outcome.
    flow.acknowledge(&container).await.expect("second settle");
    flow.requeue(&container).await.expect("requeue after ack");
    assert_eq!(transport.queue_depth("orders"), 0);
}

#[tokio::test]
async fn settling_against_a_stale_generation_is_refused() {
    let transport = InMemoryTransport::new();
    transport.seed("orders", Bytes::from_static(b"one"));
    let flow = new_flow(&transport, "orders");
    let generation = flow.bind().await.expect("bind");
    let container = flow
        .receive(Some(Duration::from_secs(1)))
        .await
        .expect("receive")
        .expect("message");
    flow.rebind().await.expect("rebind");
    assert!(container.is_stale());
    let err = flow
        .acknowledge(&container)
        .await
        .expect_err("stale settle must fail");
    assert!(matches!(err, ClientError::StaleGeneration(g) if g == generation));
    assert!(!container.is_acknowledged());
}

#[tokio::test]
async fn unbind_unblocks_a_pending_receive() {
    let transport = InMemoryTransport::new();
    let flow = new_flow(&transport, "orders");
    flow.bind().await.expect("bind");
    let blocked = {
        let flow = Arc::clone(&flow);
        tokio::spawn(async move { flow.receive(None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    flow.unbind().await;
    let received = tokio::time::timeout(Duration::from_secs(1), blocked)
        .await
        .expect("receive must return after unbind")
        .expect("join");
    assert!(received.expect("receive").is_none());
}

#[tokio::test]
async fn paused_binding_holds_messages_until_resume() {
    let transport = InMemoryTransport::new();
    transport.seed("orders", Bytes::from_static(b"held"));
    let flow = new_flow(&transport, "orders");
    // Desired state is honored even when set before the first bind.
    flow.pause().await;
    flow.bind().await.expect("bind");
    assert!(flow.is_paused());
    assert!(flow
        .receive(Some(Duration::from_millis(20)))
        .await
        .expect("receive")
        .is_none());
    flow.resume().await.expect("resume");
    assert!(flow
        .receive(Some(Duration::from_secs(1)))
        .await
        .expect("receive")
        .is_some());
}

#[tokio::test]
async fn capability_mismatch_fails_bind() {
    let transport = InMemoryTransport::with_supported_outcomes(vec![
        tether_transport::SettlementOutcome::Accepted,
    ]);
    let flow = new_flow(&transport, "orders");
    let err = flow.bind().await.expect_err("bind must fail");
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::OutcomeNotSupported(_))
    ));
    assert!(!flow.is_bound());
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingKey {
    successes: AtomicUsize,
    failures: Mutex<Vec<Arc<ClientError>>>,
}

impl RecordingKey {
    fn failure_count(&self) -> usize {
        self.failures.lock().len()
    }
}

#[async_trait]
impl CorrelationKey for RecordingKey {
    async fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_failure(&self, error: Arc<ClientError>) {
        self.failures.lock().push(error);
    }
}

#[tokio::test]
async fn batch_proxy_fires_after_all_successes() {
    let inner = Arc::new(RecordingKey::default());
    let proxy = BatchProxyCorrelationKey::new(Arc::clone(&inner) as _, 3);
    proxy.on_success().await;
    proxy.on_success().await;
    assert_eq!(inner.successes.load(Ordering::SeqCst), 0);
    proxy.on_success().await;
    assert_eq!(inner.successes.load(Ordering::SeqCst), 1);
    // Redundant late outcomes are dropped.
    proxy.on_success().await;
    proxy.on_failure(Arc::new(ClientError::ConfirmDropped)).await;
    assert_eq!(inner.successes.load(Ordering::SeqCst), 1);
    assert_eq!(inner.failure_count(), 0);
}

#[tokio::test]
async fn batch_proxy_fires_the_first_failure_only() {
    let inner = Arc::new(RecordingKey::default());
    let proxy = BatchProxyCorrelationKey::new(Arc::clone(&inner) as _, 3);
    proxy.on_success().await;
    proxy.on_failure(Arc::new(ClientError::ConfirmDropped)).await;
    proxy.on_failure(Arc::new(ClientError::ConfirmDropped)).await;
    proxy.on_success().await;
    proxy.on_success().await;
    assert_eq!(inner.failure_count(), 1);
    assert_eq!(inner.successes.load(Ordering::SeqCst), 0);
}

struct RecordingErrorSink {
    reports: Mutex<Vec<PublishErrorReport>>,
}

impl PublishErrorSink for RecordingErrorSink {
    fn on_publish_error(&self, report: PublishErrorReport) {
        self.reports.lock().push(report);
    }
}

#[tokio::test]
async fn error_routing_key_reports_before_resolving() {
    let sink = Arc::new(RecordingErrorSink {
        reports: Mutex::new(Vec::new()),
    });
    let (resolver, handle) = confirm_pair();
    let key = ErrorRoutingCorrelationKey::new(
        OutboundMessage::new(Bytes::from_static(b"payload")),
        Destination::topic("orders/created"),
        Some(Arc::clone(&sink) as _),
        Some(resolver),
    );
    key.on_failure(Arc::new(ClientError::ConfirmDropped)).await;
    assert_eq!(sink.reports.lock().len(), 1);
    assert!(handle.wait().await.is_err());
}

#[tokio::test]
async fn dropped_resolver_fails_the_confirmation() {
    let (resolver, handle) = confirm_pair();
    drop(resolver);
    let err = handle.wait().await.expect_err("must fail");
    assert!(matches!(*err, ClientError::ConfirmDropped));
}

// ---------------------------------------------------------------------------
// Watchdog scan
// ---------------------------------------------------------------------------

fn record_started_ago(elapsed: Duration) -> InFlightRecord {
    InFlightRecord {
        message_id: "m-test".to_string(),
        started: tokio::time::Instant::now() - elapsed,
        warned: false,
        escalated: false,
    }
}

#[tokio::test]
async fn watchdog_warns_exactly_once() {
    let threshold = Duration::from_millis(100);
    let stats = DispatchStats::default();
    let mut records = HashMap::new();
    records.insert(0, record_started_ago(Duration::from_millis(150)));
    let now = tokio::time::Instant::now();
    scan_in_flight(&mut records, now, threshold, &stats);
    assert_eq!(stats.snapshot().watchdog_warnings, 1);
    assert_eq!(stats.snapshot().watchdog_escalations, 0);
    scan_in_flight(&mut records, now, threshold, &stats);
    assert_eq!(stats.snapshot().watchdog_warnings, 1);
}

#[tokio::test]
async fn watchdog_escalates_exactly_once_past_ten_times_threshold() {
    let threshold = Duration::from_millis(100);
    let stats = DispatchStats::default();
    let mut records = HashMap::new();
    // 20x the threshold: both the warning and the escalation fire, once.
    records.insert(0, record_started_ago(Duration::from_millis(2000)));
    let now = tokio::time::Instant::now();
    scan_in_flight(&mut records, now, threshold, &stats);
    scan_in_flight(&mut records, now, threshold, &stats);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.watchdog_warnings, 1);
    assert_eq!(snapshot.watchdog_escalations, 1);
}

#[tokio::test]
async fn watchdog_sleep_tracks_the_soonest_warning() {
    let threshold = Duration::from_millis(100);
    let stats = DispatchStats::default();
    let mut records = HashMap::new();
    let now = tokio::time::Instant::now();
    records.insert(
        0,
        InFlightRecord {
            message_id: "m-test".to_string(),
            started: now - Duration::from_millis(80),
            warned: false,
            escalated: false,
        },
    );
    let sleep = scan_in_flight(&mut records, now, threshold, &stats);
    // 20ms until the warning deadline, plus the 1ms slack.
    assert_eq!(sleep, Duration::from_millis(21));
}

#[tokio::test]
async fn watchdog_sleep_defaults_to_half_the_threshold() {
    let threshold = Duration::from_millis(100);
    let stats = DispatchStats::default();
    let mut records = HashMap::new();
    let sleep = scan_in_flight(&mut records, tokio::time::Instant::now(), threshold, &stats);
    assert_eq!(sleep, Duration::from_millis(50));
}

#[tokio::test]
async fn watchdog_sleep_is_floored() {
    let threshold = Duration::from_millis(100);
    let stats = DispatchStats::default();
    let mut records = HashMap::new();
    records.insert(0, record_started_ago(Duration::from_millis(99)));
    let sleep = scan_in_flight(&mut records, tokio::time::Instant::now(), threshold, &stats);
    assert!(sleep >= Duration::from_millis(10));
}

// ---------------------------------------------------------------------------
// Error queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn below_threshold_requeues_instead_of_republishing() {
    let transport = InMemoryTransport::new();
    transport.seed("orders", Bytes::from_static(b"flaky"));
    let flow = new_flow(&transport, "orders");
    flow.bind().await.expect("bind");
    let producer = Arc::new(transport.clone())
        .create_producer()
        .await
        .expect("producer");
    let infra = ErrorQueueInfrastructure::new(producer, Destination::queue("orders.errors"), 3);

    for expected_attempt in 1..=2u32 {
        let container = Arc::new(
            flow.receive(Some(Duration::from_secs(1)))
                .await
                .expect("receive")
                .expect("message"),
        );
        assert_eq!(container.message().delivery_count(), expected_attempt);
        infra
            .republish_or_requeue(Arc::clone(&flow), container)
            .await
            .expect("policy");
    }
    assert_eq!(transport.queue_depth("orders"), 1);
    assert_eq!(transport.queue_depth("orders.errors"), 0);
}

#[tokio::test]
async fn at_threshold_republishes_and_acknowledges() {
    let transport = InMemoryTransport::new();
    transport.seed("orders", Bytes::from_static(b"poison"));
    let flow = new_flow(&transport, "orders");
    flow.bind().await.expect("bind");
    let producer = Arc::new(transport.clone())
        .create_producer()
        .await
        .expect("producer");
    let infra = ErrorQueueInfrastructure::new(producer, Destination::queue("orders.errors"), 3);

    for _ in 0..2 {
        let container = Arc::new(
            flow.receive(Some(Duration::from_secs(1)))
                .await
                .expect("receive")
                .expect("message"),
        );
        infra
            .republish_or_requeue(Arc::clone(&flow), container)
            .await
            .expect("policy");
    }
    let container = Arc::new(
        flow.receive(Some(Duration::from_secs(1)))
            .await
            .expect("receive")
            .expect("third delivery"),
    );
    assert_eq!(container.message().delivery_count(), 3);
    infra
        .republish_or_requeue(Arc::clone(&flow), Arc::clone(&container))
        .await
        .expect("policy");

    assert!(container.is_acknowledged());
    assert_eq!(transport.queue_depth("orders"), 0);
    let errors = transport.snapshot("orders.errors");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].headers.get(ATTEMPTS_HEADER).map(String::as_str), Some("3"));
    assert_eq!(
        errors[0].headers.get(SOURCE_ENDPOINT_HEADER).map(String::as_str),
        Some("orders")
    );
}

#[tokio::test]
async fn failed_republish_requeues_the_original() {
    let transport = InMemoryTransport::new();
    transport.seed("orders", Bytes::from_static(b"poison"));
    let flow = new_flow(&transport, "orders");
    flow.bind().await.expect("bind");
    let producer = Arc::new(transport.clone())
        .create_producer()
        .await
        .expect("producer");
    // A closed producer makes every republish fail.
    producer.close().await;
    let infra = ErrorQueueInfrastructure::new(producer, Destination::queue("orders.errors"), 1);

    let container = Arc::new(
        flow.receive(Some(Duration::from_secs(1)))
            .await
            .expect("receive")
            .expect("message"),
    );
    infra
        .republish_or_requeue(Arc::clone(&flow), Arc::clone(&container))
        .await
        .expect("policy");

    assert!(container.is_acknowledged());
    assert_eq!(transport.queue_depth("orders.errors"), 0);
    assert_eq!(transport.queue_depth("orders"), 1);
}

#[tokio::test]
async fn handler_without_error_queue_requeues() {
    let transport = InMemoryTransport::new();
    transport.seed("orders", Bytes::from_static(b"flaky"));
    let flow = new_flow(&transport, "orders");
    flow.bind().await.expect("bind");
    let handler = ErrorMessageHandler::new(Arc::clone(&flow), None);
    let container = Arc::new(
        flow.receive(Some(Duration::from_secs(1)))
            .await
            .expect("receive")
            .expect("message"),
    );
    handler
        .on_error(container, anyhow::anyhow!("boom"))
        .await;
    assert_eq!(transport.queue_depth("orders"), 1);
}

#[test]
fn error_queue_name_defaults_to_endpoint_suffix() {
    let config = EngineConfig::default();
    assert_eq!(error_queue_name("orders", &config), "orders.errors");
    let config = EngineConfig {
        error_queue_name: Some("dead-letters".to_string()),
        ..EngineConfig::default()
    };
    assert_eq!(error_queue_name("orders", &config), "dead-letters");
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

struct ScriptedProducer {
    fail_on_send: Option<usize>,
    commit_error: Mutex<Option<TransportError>>,
    rollback_fails: bool,
    sends: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl ScriptedProducer {
    fn succeeding() -> Self {
        Self {
            fail_on_send: None,
            commit_error: Mutex::new(None),
            rollback_fails: false,
            sends: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProducerChannel for ScriptedProducer {
    async fn send(
        &self,
        _message: OutboundMessage,
        destination: &Destination,
    ) -> tether_transport::Result<()> {
        let sequence = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_send == Some(sequence) {
            return Err(TransportError::Send {
                destination: destination.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) {}
}

#[async_trait]
impl TransactedProducer for ScriptedProducer {
    async fn commit(&self) -> tether_transport::Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        match self.commit_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn rollback(&self) -> tether_transport::Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        if self.rollback_fails {
            return Err(TransportError::Rollback("scripted failure".to_string()));
        }
        Ok(())
    }
}

struct ScriptedTransport {
    producer: Arc<ScriptedProducer>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn create_channel(
        &self,
        endpoint: &EndpointDescriptor,
        _config: ChannelConfig,
        _events: Arc<dyn FlowEventListener>,
    ) -> tether_transport::Result<Arc<dyn ReceiveChannel>> {
        Err(TransportError::ChannelCreation {
            endpoint: endpoint.name.clone(),
            reason: "publish-only transport".to_string(),
        })
    }

    async fn create_producer(&self) -> tether_transport::Result<Arc<dyn ProducerChannel>> {
        Ok(Arc::clone(&self.producer) as _)
    }

    async fn create_transacted_producer(
        &self,
    ) -> tether_transport::Result<Arc<dyn TransactedProducer>> {
        Ok(Arc::clone(&self.producer) as _)
    }
}

fn batch(count: usize) -> Vec<OutboundMessage> {
    (0..count)
        .map(|i| OutboundMessage::new(Bytes::from(format!("payload-{i}"))))
        .collect()
}

fn transacted_options() -> PublisherOptions {
    PublisherOptions {
        transacted: true,
        batched_consumer: true,
        ..PublisherOptions::new(Destination::queue("out"))
    }
}

#[tokio::test]
async fn transacted_non_batched_is_rejected_at_construction() {
    let transport = Arc::new(ScriptedTransport {
        producer: Arc::new(ScriptedProducer::succeeding()),
    });
    let options = PublisherOptions {
        transacted: true,
        ..PublisherOptions::new(Destination::queue("out"))
    };
    let err = TransactionalPublisher::new(transport, options)
        .await
        .expect_err("must be rejected");
    assert!(matches!(err, ClientError::IllegalConfiguration(_)));
}

#[tokio::test]
async fn transacted_with_error_queue_autobind_is_rejected() {
    let transport = Arc::new(ScriptedTransport {
        producer: Arc::new(ScriptedProducer::succeeding()),
    });
    let options = PublisherOptions {
        error_queue_autobind: true,
        ..transacted_options()
    };
    let err = TransactionalPublisher::new(transport, options)
        .await
        .expect_err("must be rejected");
    assert!(matches!(err, ClientError::IllegalConfiguration(_)));
}

#[tokio::test]
async fn transacted_batch_commits_once() {
    let producer = Arc::new(ScriptedProducer::succeeding());
    let transport = Arc::new(ScriptedTransport {
        producer: Arc::clone(&producer),
    });
    let publisher = TransactionalPublisher::new(transport, transacted_options())
        .await
        .expect("publisher");
    publisher.start();
    let key = Arc::new(RecordingKey::default());
    publisher
        .publish(PublishRequest::new(batch(3)), Arc::clone(&key) as _)
        .await
        .expect("publish");
    assert_eq!(producer.sends.load(Ordering::SeqCst), 3);
    assert_eq!(producer.commits.load(Ordering::SeqCst), 1);
    assert_eq!(producer.rollbacks.load(Ordering::SeqCst), 0);
    assert_eq!(key.successes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mid_batch_send_failure_rolls_back_without_committing() {
    let producer = Arc::new(ScriptedProducer {
        fail_on_send: Some(2),
        ..ScriptedProducer::succeeding()
    });
    let transport = Arc::new(ScriptedTransport {
        producer: Arc::clone(&producer),
    });
    let publisher = TransactionalPublisher::new(transport, transacted_options())
        .await
        .expect("publisher");
    publisher.start();
    let key = Arc::new(RecordingKey::default());
    publisher
        .publish(PublishRequest::new(batch(3)), Arc::clone(&key) as _)
        .await
        .expect("publish");
    // The third message is never attempted.
    assert_eq!(producer.sends.load(Ordering::SeqCst), 2);
    assert_eq!(producer.commits.load(Ordering::SeqCst), 0);
    assert_eq!(producer.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(key.failure_count(), 1);
    assert_eq!(key.successes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn commit_failure_rolls_back_and_fails_with_the_original_error() {
    let producer = Arc::new(ScriptedProducer {
        commit_error: Mutex::new(Some(TransportError::Commit("broker refused".to_string()))),
        ..ScriptedProducer::succeeding()
    });
    let transport = Arc::new(ScriptedTransport {
        producer: Arc::clone(&producer),
    });
    let publisher = TransactionalPublisher::new(transport, transacted_options())
        .await
        .expect("publisher");
    publisher.start();
    let key = Arc::new(RecordingKey::default());
    publisher
        .publish(PublishRequest::new(batch(2)), Arc::clone(&key) as _)
        .await
        .expect("publish");
    assert_eq!(producer.rollbacks.load(Ordering::SeqCst), 1);
    let failures = key.failures.lock();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &*failures[0],
        ClientError::Transport(TransportError::Commit(_))
    ));
}

#[tokio::test]
async fn rolled_back_commit_failure_skips_the_explicit_rollback() {
    let producer = Arc::new(ScriptedProducer {
        commit_error: Mutex::new(Some(TransportError::RolledBack(
            "conflict".to_string(),
        ))),
        ..ScriptedProducer::succeeding()
    });
    let transport = Arc::new(ScriptedTransport {
        producer: Arc::clone(&producer),
    });
    let publisher = TransactionalPublisher::new(transport, transacted_options())
        .await
        .expect("publisher");
    publisher.start();
    let key = Arc::new(RecordingKey::default());
    publisher
        .publish(PublishRequest::new(batch(1)), Arc::clone(&key) as _)
        .await
        .expect("publish");
    assert_eq!(producer.rollbacks.load(Ordering::SeqCst), 0);
    assert_eq!(key.failure_count(), 1);
}

#[tokio::test]
async fn rollback_failure_is_chained_as_a_suppressed_cause() {
    let producer = Arc::new(ScriptedProducer {
        commit_error: Mutex::new(Some(TransportError::Commit("broker refused".to_string()))),
        rollback_fails: true,
        ..ScriptedProducer::succeeding()
    });
    let transport = Arc::new(ScriptedTransport {
        producer: Arc::clone(&producer),
    });
    let publisher = TransactionalPublisher::new(transport, transacted_options())
        .await
        .expect("publisher");
    publisher.start();
    let key = Arc::new(RecordingKey::default());
    publisher
        .publish(PublishRequest::new(batch(1)), Arc::clone(&key) as _)
        .await
        .expect("publish");
    let failures = key.failures.lock();
    assert!(matches!(
        &*failures[0],
        ClientError::Rollback {
            source: TransportError::Commit(_),
            rollback_error: Some(TransportError::Rollback(_)),
        }
    ));
}

#[tokio::test]
async fn non_transacted_batch_resolves_through_the_proxy() {
    let producer = Arc::new(ScriptedProducer::succeeding());
    let transport = Arc::new(ScriptedTransport {
        producer: Arc::clone(&producer),
    });
    let publisher =
        TransactionalPublisher::new(transport, PublisherOptions::new(Destination::queue("out")))
            .await
            .expect("publisher");
    publisher.start();
    let key = Arc::new(RecordingKey::default());
    publisher
        .publish(PublishRequest::new(batch(3)), Arc::clone(&key) as _)
        .await
        .expect("publish");
    assert_eq!(key.successes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_transacted_send_failure_fails_the_key_without_atomicity() {
    let producer = Arc::new(ScriptedProducer {
        fail_on_send: Some(2),
        ..ScriptedProducer::succeeding()
    });
    let transport = Arc::new(ScriptedTransport {
        producer: Arc::clone(&producer),
    });
    let publisher =
        TransactionalPublisher::new(transport, PublisherOptions::new(Destination::queue("out")))
            .await
            .expect("publisher");
    publisher.start();
    let key = Arc::new(RecordingKey::default());
    publisher
        .publish(PublishRequest::new(batch(3)), Arc::clone(&key) as _)
        .await
        .expect("publish");
    // Remaining messages are still attempted; there is no transaction to
    // undo the first one.
    assert_eq!(producer.sends.load(Ordering::SeqCst), 3);
    assert_eq!(key.failure_count(), 1);
    assert_eq!(key.successes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stopped_publisher_fails_the_key_and_the_confirmation() {
    let transport = Arc::new(ScriptedTransport {
        producer: Arc::new(ScriptedProducer::succeeding()),
    });
    let publisher =
        TransactionalPublisher::new(transport, PublisherOptions::new(Destination::queue("out")))
            .await
            .expect("publisher");
    assert!(!publisher.is_running());
    let key = Arc::new(RecordingKey::default());
    let (resolver, handle) = confirm_pair();
    publisher
        .publish(
            PublishRequest::new(batch(1)).with_confirm(resolver),
            Arc::clone(&key) as _,
        )
        .await
        .expect("publish");
    assert_eq!(key.failure_count(), 1);
    assert!(matches!(
        *handle.wait().await.expect_err("must fail"),
        ClientError::NotRunning(_)
    ));
}

#[tokio::test]
async fn confirmations_require_persistent_delivery() {
    let transport = Arc::new(ScriptedTransport {
        producer: Arc::new(ScriptedProducer::succeeding()),
    });
    let options = PublisherOptions {
        delivery_mode: DeliveryMode::Direct,
        ..PublisherOptions::new(Destination::queue("out"))
    };
    let publisher = TransactionalPublisher::new(transport, options)
        .await
        .expect("publisher");
    publisher.start();
    let (resolver, _handle) = confirm_pair();
    let err = publisher
        .publish(
            PublishRequest::new(batch(1)).with_confirm(resolver),
            Arc::new(RecordingKey::default()) as _,
        )
        .await
        .expect_err("must be rejected");
    assert!(matches!(err, ClientError::IllegalConfiguration(_)));
}

#[tokio::test]
async fn destination_header_overrides_the_static_destination() {
    let transport = InMemoryTransport::new();
    let publisher = TransactionalPublisher::new(
        Arc::new(transport.clone()),
        PublisherOptions::new(Destination::queue("static")),
    )
    .await
    .expect("publisher");
    publisher.start();
    let messages = vec![
        OutboundMessage::new(Bytes::from_static(b"routed"))
            .with_header(TARGET_DESTINATION_HEADER, "queue:dynamic"),
        OutboundMessage::new(Bytes::from_static(b"plain")),
    ];
    publisher
        .publish(
            PublishRequest::new(messages),
            Arc::new(RecordingKey::default()) as _,
        )
        .await
        .expect("publish");
    assert_eq!(transport.queue_depth("dynamic"), 1);
    assert_eq!(transport.queue_depth("static"), 1);
}

// ---------------------------------------------------------------------------
// Reconnect registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnected_runs_every_registered_task() {
    let registry = Arc::new(ReconnectTaskRegistry::new());
    let runs = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let runs = Arc::clone(&runs);
        registry.register(Arc::new(move || {
            let runs = Arc::clone(&runs);
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));
    }
    registry.handle_session_event(SessionEvent::Reconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(registry.task_count(), 3);
}

#[tokio::test]
async fn failing_task_is_deregistered() {
    let registry = Arc::new(ReconnectTaskRegistry::new());
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = Arc::clone(&runs);
        registry.register(Arc::new(move || {
            let runs = Arc::clone(&runs);
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));
    }
    registry.register(Arc::new(|| {
        Box::pin(async { Err(anyhow::anyhow!("recovery target is gone")) })
    }));
    registry.handle_session_event(SessionEvent::Reconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.task_count(), 1);
    registry.handle_session_event(SessionEvent::Reconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn session_events_from_a_foreign_thread_still_run_tasks() {
    let registry = Arc::new(ReconnectTaskRegistry::new());
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = Arc::clone(&runs);
        registry.register(Arc::new(move || {
            let runs = Arc::clone(&runs);
            Box::pin(async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }));
    }
    // Transport callback threads are not runtime workers; the registry's
    // captured handle has to carry the spawn.
    let reporter = {
        let registry = Arc::clone(&registry);
        std::thread::spawn(move || {
            registry.handle_session_event(SessionEvent::Reconnected);
        })
    };
    reporter.join().expect("reporter thread");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unregister_is_handle_based() {
    let registry = Arc::new(ReconnectTaskRegistry::new());
    let handle = registry.register(Arc::new(|| Box::pin(async { Ok(()) })));
    assert!(registry.unregister(handle));
    assert!(!registry.unregister(handle));
    assert_eq!(registry.task_count(), 0);
}

#[derive(Default)]
struct RecordingSink {
    ups: AtomicUsize,
    reconnectings: AtomicUsize,
    downs: AtomicUsize,
}

impl HealthSink for RecordingSink {
    fn up(&self) {
        self.ups.fetch_add(1, Ordering::SeqCst);
    }

    fn reconnecting(&self) {
        self.reconnectings.fetch_add(1, Ordering::SeqCst);
    }

    fn down(&self) {
        self.downs.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn session_events_fan_out_to_observers() {
    let registry = Arc::new(ReconnectTaskRegistry::new());
    let sink = Arc::new(RecordingSink::default());
    registry.add_observer(Arc::new(crate::health::SessionHealthObserver::new(
        Arc::clone(&sink) as _,
    )));
    registry.handle_session_event(SessionEvent::Reconnecting);
    registry.handle_session_event(SessionEvent::Down);
    registry.handle_session_event(SessionEvent::Reconnected);
    assert_eq!(sink.reconnectings.load(Ordering::SeqCst), 1);
    assert_eq!(sink.downs.load(Ordering::SeqCst), 1);
    assert_eq!(sink.ups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn flow_events_drive_the_health_sink() {
    let sink = Arc::new(RecordingSink::default());
    let listener = FlowHealthListener::new("orders", Arc::clone(&sink) as _);
    let reconnects = Arc::new(AtomicUsize::new(0));
    {
        let reconnects = Arc::clone(&reconnects);
        listener.add_reconnect_listener(Arc::new(move || {
            reconnects.fetch_add(1, Ordering::SeqCst);
        }));
    }
    listener.on_flow_event(FlowEvent::Down);
    listener.on_flow_event(FlowEvent::Reconnecting);
    listener.on_flow_event(FlowEvent::Reconnected);
    assert_eq!(sink.downs.load(Ordering::SeqCst), 1);
    assert_eq!(sink.reconnectings.load(Ordering::SeqCst), 1);
    assert_eq!(sink.ups.load(Ordering::SeqCst), 1);
    assert_eq!(reconnects.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn clear_config_env() {
    for key in [
        "TETHER_WORKER_COUNT",
        "TETHER_HANDOFF_TIMEOUT_MS",
        "TETHER_MAX_PROCESSING_TIME_MS",
        "TETHER_MAX_DELIVERY_ATTEMPTS",
        "TETHER_ERROR_QUEUE",
        "TETHER_CONFIG",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn config_defaults() {
    clear_config_env();
    let config = EngineConfig::from_env_or_yaml().expect("config");
    assert_eq!(config.worker_count, 1);
    assert_eq!(config.handoff_timeout_ms, 1000);
    assert_eq!(config.max_processing_time_ms, 60_000);
    assert_eq!(config.max_delivery_attempts, 3);
    assert!(config.error_queue_name.is_none());
}

#[test]
#[serial]
fn config_env_overrides() {
    clear_config_env();
    std::env::set_var("TETHER_WORKER_COUNT", "4");
    std::env::set_var("TETHER_MAX_DELIVERY_ATTEMPTS", "5");
    std::env::set_var("TETHER_ERROR_QUEUE", "dead-letters");
    let config = EngineConfig::from_env();
    assert_eq!(config.worker_count, 4);
    assert_eq!(config.max_delivery_attempts, 5);
    assert_eq!(config.error_queue_name.as_deref(), Some("dead-letters"));
    clear_config_env();
}

#[test]
#[serial]
fn config_zero_env_values_are_ignored() {
    clear_config_env();
    std::env::set_var("TETHER_WORKER_COUNT", "0");
    std::env::set_var("TETHER_HANDOFF_TIMEOUT_MS", "0");
    let config = EngineConfig::from_env();
    assert_eq!(config.worker_count, 1);
    assert_eq!(config.handoff_timeout_ms, 1000);
    clear_config_env();
}

#[test]
#[serial]
fn config_yaml_overrides_env() {
    clear_config_env();
    std::env::set_var("TETHER_WORKER_COUNT", "2");
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "worker_count: 8").expect("write");
    writeln!(file, "max_processing_time_ms: 0").expect("write");
    writeln!(file, "error_queue_name: from-yaml").expect("write");
    std::env::set_var("TETHER_CONFIG", file.path());
    let config = EngineConfig::from_env_or_yaml().expect("config");
    assert_eq!(config.worker_count, 8);
    // Zero in the override file is ignored, not applied.
    assert_eq!(config.max_processing_time_ms, 60_000);
    assert_eq!(config.error_queue_name.as_deref(), Some("from-yaml"));
    clear_config_env();
}

#[test]
#[serial]
fn config_invalid_yaml_is_an_error() {
    clear_config_env();
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "worker_count: [not a number").expect("write");
    std::env::set_var("TETHER_CONFIG", file.path());
    let err = EngineConfig::from_env_or_yaml().expect_err("must fail");
    assert!(matches!(err, ClientError::IllegalConfiguration(_)));
    clear_config_env();
}
