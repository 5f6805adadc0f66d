// Producer-side engine. A publish request is a batch of messages plus one
// correlation key; the key (and the caller's optional confirmation) is
// resolved exactly once per request, at the transaction boundary when the
// producer is transacted.
use crate::correlation::{BatchProxyCorrelationKey, ConfirmResolver, CorrelationKey};
use crate::error::{ClientError, Result};
use crate::telemetry::t_counter;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_transport::{
    Destination, OutboundMessage, ProducerChannel, TransactedProducer, Transport, TransportError,
};
use uuid::Uuid;

/// Header that routes one message somewhere other than the configured
/// destination. `queue:` and `topic:` prefixes pick the kind; a bare name
/// is a topic.
pub const TARGET_DESTINATION_HEADER: &str = "x-target-destination";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Persistent,
    Direct,
}

#[derive(Debug, Clone)]
pub struct PublisherOptions {
    pub destination: Destination,
    pub delivery_mode: DeliveryMode,
    pub transacted: bool,
    /// Whether the paired consumer binding processes in batches.
    pub batched_consumer: bool,
    /// Whether an error queue is auto-bound for the paired consumer.
    pub error_queue_autobind: bool,
}

impl PublisherOptions {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            delivery_mode: DeliveryMode::Persistent,
            transacted: false,
            batched_consumer: false,
            error_queue_autobind: false,
        }
    }
}

/// One batch to publish. The correlation key passed alongside is resolved
/// after all messages succeed or on the first failure.
pub struct PublishRequest {
    pub messages: Vec<OutboundMessage>,
    /// Caller-supplied confirmation, resolved together with the key.
    pub confirm: Option<ConfirmResolver>,
}

impl PublishRequest {
    pub fn new(messages: Vec<OutboundMessage>) -> Self {
        Self {
            messages,
            confirm: None,
        }
    }

    pub fn with_confirm(mut self, confirm: ConfirmResolver) -> Self {
        self.confirm = Some(confirm);
        self
    }
}

enum ActiveProducer {
    Plain(Arc<dyn ProducerChannel>),
    Transacted(Arc<dyn TransactedProducer>),
}

impl std::fmt::Debug for ActiveProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActiveProducer::Plain(_) => f.write_str("Plain"),
            ActiveProducer::Transacted(_) => f.write_str("Transacted"),
        }
    }
}

impl ActiveProducer {
    async fn send(&self, message: OutboundMessage, destination: &Destination) -> tether_transport::Result<()> {
        match self {
            ActiveProducer::Plain(producer) => producer.send(message, destination).await,
            ActiveProducer::Transacted(producer) => producer.send(message, destination).await,
        }
    }

    async fn close(&self) {
        match self {
            ActiveProducer::Plain(producer) => producer.close().await,
            ActiveProducer::Transacted(producer) => producer.close().await,
        }
    }
}

// Resolves the caller's confirmation in lockstep with the wrapped key.
struct ConfirmingKey {
    inner: Arc<dyn CorrelationKey>,
    confirm: Option<ConfirmResolver>,
}

#[async_trait]
impl CorrelationKey for ConfirmingKey {
    async fn on_success(&self) {
        self.inner.on_success().await;
        if let Some(confirm) = &self.confirm {
            confirm.resolve(Ok(()));
        }
    }

    async fn on_failure(&self, error: Arc<ClientError>) {
        self.inner.on_failure(Arc::clone(&error)).await;
        if let Some(confirm) = &self.confirm {
            confirm.resolve(Err(error));
        }
    }
}

/// Publisher for one producer binding.
///
/// Unsupported option combinations are rejected here, at construction,
/// rather than surfacing as per-request failures later: a transaction
/// spanning a non-batched consumer would commit per message, and an
/// auto-bound error queue would publish outside the transaction.
#[derive(Debug)]
pub struct TransactionalPublisher {
    id: Uuid,
    options: PublisherOptions,
    producer: ActiveProducer,
    running: AtomicBool,
}

impl TransactionalPublisher {
    pub async fn new(transport: Arc<dyn Transport>, options: PublisherOptions) -> Result<Self> {
        if options.transacted && !options.batched_consumer {
            return Err(ClientError::IllegalConfiguration(
                "transacted publishing requires a batched consumer".to_string(),
            ));
        }
        if options.transacted && options.error_queue_autobind {
            return Err(ClientError::IllegalConfiguration(
                "transacted publishing cannot be combined with error-queue auto-binding"
                    .to_string(),
            ));
        }
        let producer = if options.transacted {
            ActiveProducer::Transacted(transport.create_transacted_producer().await?)
        } else {
            ActiveProducer::Plain(transport.create_producer().await?)
        };
        Ok(Self {
            id: Uuid::new_v4(),
            options,
            producer,
            running: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn start(&self) {
        tracing::info!(publisher = %self.id, "starting publisher");
        self.running.store(true, Ordering::Release);
    }

    pub fn stop(&self) {
        tracing::info!(publisher = %self.id, "stopping publisher");
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn close(&self) {
        self.stop();
        self.producer.close().await;
    }

    /// Publish one request, resolving `key` (and the request's
    /// confirmation) exactly once.
    ///
    /// Non-transacted: each message is sent independently; the key fires
    /// with success after all of them, or with the first failure, and the
    /// remaining messages are still attempted. Transacted: the first send
    /// failure rolls the transaction back, otherwise the batch commits and
    /// the key resolves off the commit outcome.
    pub async fn publish(
        &self,
        request: PublishRequest,
        key: Arc<dyn CorrelationKey>,
    ) -> Result<()> {
        if request.confirm.is_some() && self.options.delivery_mode == DeliveryMode::Direct {
            return Err(ClientError::IllegalConfiguration(
                "publish confirmations require persistent delivery".to_string(),
            ));
        }
        let key: Arc<dyn CorrelationKey> = Arc::new(ConfirmingKey {
            inner: key,
            confirm: request.confirm,
        });
        if !self.is_running() {
            key.on_failure(Arc::new(ClientError::NotRunning(self.id))).await;
            return Ok(());
        }
        if request.messages.is_empty() {
            key.on_success().await;
            return Ok(());
        }

        if self.options.transacted {
            self.publish_transacted(request.messages, key).await
        } else {
            self.publish_plain(request.messages, key).await
        }
    }

    async fn publish_plain(
        &self,
        messages: Vec<OutboundMessage>,
        key: Arc<dyn CorrelationKey>,
    ) -> Result<()> {
        let proxy = BatchProxyCorrelationKey::new(key, messages.len());
        for message in messages {
            let destination = self.resolve_destination(&message);
            match self.producer.send(message, &destination).await {
                Ok(()) => {
                    t_counter!("tether_messages_published_total").increment(1);
                    proxy.on_success().await;
                }
                Err(err) => {
                    proxy
                        .on_failure(Arc::new(ClientError::Transport(err)))
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn publish_transacted(
        &self,
        messages: Vec<OutboundMessage>,
        key: Arc<dyn CorrelationKey>,
    ) -> Result<()> {
        let ActiveProducer::Transacted(producer) = &self.producer else {
            unreachable!("transacted options always build a transacted producer");
        };
        tracing::debug!(publisher = %self.id, batch = messages.len(), "sending transacted batch");
        for message in messages {
            let destination = self.resolve_destination(&message);
            if let Err(err) = producer.send(message, &destination).await {
                self.roll_back(producer.as_ref(), err, &key).await;
                return Ok(());
            }
        }
        match producer.commit().await {
            Ok(()) => {
                t_counter!("tether_transactions_committed_total").increment(1);
                tracing::debug!(publisher = %self.id, "transaction committed");
                key.on_success().await;
            }
            Err(err @ TransportError::RolledBack(_)) => {
                // The broker already rolled the transaction back; a second
                // rollback would fail against a dead transaction.
                t_counter!("tether_transactions_rolled_back_total").increment(1);
                key.on_failure(Arc::new(ClientError::Transport(err))).await;
            }
            Err(err) => {
                self.roll_back(producer.as_ref(), err, &key).await;
            }
        }
        Ok(())
    }

    async fn roll_back(
        &self,
        producer: &dyn TransactedProducer,
        source: TransportError,
        key: &Arc<dyn CorrelationKey>,
    ) {
        t_counter!("tether_transactions_rolled_back_total").increment(1);
        tracing::warn!(publisher = %self.id, error = %source, "rolling back transaction");
        let error = match producer.rollback().await {
            Ok(()) => ClientError::Transport(source),
            Err(rollback_error) => {
                tracing::error!(
                    publisher = %self.id,
                    error = %rollback_error,
                    "rollback failed"
                );
                ClientError::Rollback {
                    source,
                    rollback_error: Some(rollback_error),
                }
            }
        };
        key.on_failure(Arc::new(error)).await;
    }

    fn resolve_destination(&self, message: &OutboundMessage) -> Destination {
        match message.headers.get(TARGET_DESTINATION_HEADER) {
            Some(target) => {
                if let Some(queue) = target.strip_prefix("queue:") {
                    Destination::queue(queue)
                } else if let Some(topic) = target.strip_prefix("topic:") {
                    Destination::topic(topic)
                } else {
                    Destination::topic(target.as_str())
                }
            }
            None => self.options.destination.clone(),
        }
    }
}
