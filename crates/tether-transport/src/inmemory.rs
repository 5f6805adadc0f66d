// In-memory transport: named queues with redelivery accounting and
// dead-letter routing. Faithful enough to exercise the whole engine in
// tests and to embed the client in a single process.
use crate::{
    ChannelConfig, Destination, EndpointDescriptor, FlowEvent, FlowEventListener, InboundMessage,
    MessageListener, MessageSettler, OutboundMessage, ProducerChannel, ReceiveChannel, Result,
    SettlementOutcome, TransactedProducer, Transport, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_message_id() -> String {
    format!("m-{}", NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    payload: Bytes,
    headers: HashMap<String, String>,
    delivery_count: u32,
}

/// Snapshot of a queued message, for assertions and inspection.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub delivery_count: u32,
}

struct QueueCore {
    name: String,
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
    push: Mutex<Option<Arc<dyn MessageListener>>>,
    event_listeners: Mutex<Vec<Arc<dyn FlowEventListener>>>,
}

impl QueueCore {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            push: Mutex::new(None),
            event_listeners: Mutex::new(Vec::new()),
        }
    }
}

struct TransportCore {
    queues: Mutex<HashMap<String, Arc<QueueCore>>>,
    dead_letter_routes: Mutex<HashMap<String, String>>,
    supported_outcomes: Vec<SettlementOutcome>,
}

impl TransportCore {
    fn queue(self: &Arc<Self>, name: &str) -> Arc<QueueCore> {
        let mut queues = self.queues.lock();
        Arc::clone(
            queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(QueueCore::new(name))),
        )
    }

    /// Hand a message to the queue: push-mode channels get it delivered on
    /// a spawned task, pull-mode channels find it on the queue.
    fn deliver(self: &Arc<Self>, queue: &Arc<QueueCore>, stored: StoredMessage) {
        let push = queue.push.lock().clone();
        if let Some(listener) = push {
            let message = self.wrap(queue, stored);
            tokio::spawn(async move { listener.on_message(message).await });
        } else {
            queue.messages.lock().push_back(stored);
            queue.notify.notify_one();
        }
    }

    fn wrap(self: &Arc<Self>, queue: &Arc<QueueCore>, stored: StoredMessage) -> InboundMessage {
        let settler = Arc::new(InMemorySettler {
            core: Arc::clone(self),
            queue: Arc::clone(queue),
            slot: Mutex::new(Some(stored.clone())),
        });
        InboundMessage::new(
            stored.id,
            stored.payload,
            stored.headers,
            stored.delivery_count,
            settler,
        )
    }
}

struct InMemorySettler {
    core: Arc<TransportCore>,
    queue: Arc<QueueCore>,
    // Taken on first settle; a second settle through the same hook is a
    // transport-level error.
    slot: Mutex<Option<StoredMessage>>,
}

#[async_trait]
impl MessageSettler for InMemorySettler {
    async fn settle(&self, outcome: SettlementOutcome) -> Result<()> {
        let Some(mut stored) = self.slot.lock().take() else {
            return Err(TransportError::Settle(format!(
                "message already settled on queue {}",
                self.queue.name
            )));
        };
        match outcome {
            SettlementOutcome::Accepted => {}
            SettlementOutcome::Failed => {
                stored.delivery_count += 1;
                self.core.deliver(&self.queue, stored);
            }
            SettlementOutcome::Rejected => {
                let route = self
                    .core
                    .dead_letter_routes
                    .lock()
                    .get(&self.queue.name)
                    .cloned();
                if let Some(dead_letter_queue) = route {
                    let target = self.core.queue(&dead_letter_queue);
                    self.core.deliver(&target, stored);
                } else {
                    tracing::debug!(
                        queue = %self.queue.name,
                        message_id = %stored.id,
                        "rejected message discarded (no dead-letter route)"
                    );
                }
            }
        }
        Ok(())
    }
}

struct InMemoryChannel {
    core: Arc<TransportCore>,
    queue: Arc<QueueCore>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn try_pop(&self) -> Option<StoredMessage> {
        if !self.started.load(Ordering::Acquire) {
            return None;
        }
        self.queue.messages.lock().pop_front()
    }
}

#[async_trait]
impl ReceiveChannel for InMemoryChannel {
    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<InboundMessage>> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            if let Some(stored) = self.try_pop() {
                return Ok(Some(self.core.wrap(&self.queue, stored)));
            }
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            // Re-check after registering with the notifier so an enqueue or
            // close between the check and the registration is not missed.
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            if let Some(stored) = self.try_pop() {
                return Ok(Some(self.core.wrap(&self.queue, stored)));
            }
            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        // Timed out; one final no-wait poll.
                        if let Some(stored) = self.try_pop() {
                            return Ok(Some(self.core.wrap(&self.queue, stored)));
                        }
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue.notify.notify_waiters();
    }

    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::Release);
        self.queue.notify.notify_waiters();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::Release);
        Ok(())
    }
}

struct InMemoryProducer {
    core: Arc<TransportCore>,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerChannel for InMemoryProducer {
    async fn send(&self, message: OutboundMessage, destination: &Destination) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Send {
                destination: destination.to_string(),
                reason: "producer is closed".to_string(),
            });
        }
        let queue = self.core.queue(&destination.name);
        self.core.deliver(
            &queue,
            StoredMessage {
                id: next_message_id(),
                payload: message.payload,
                headers: message.headers,
                delivery_count: 1,
            },
        );
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct InMemoryTransactedProducer {
    core: Arc<TransportCore>,
    buffer: Mutex<Vec<(OutboundMessage, Destination)>>,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerChannel for InMemoryTransactedProducer {
    async fn send(&self, message: OutboundMessage, destination: &Destination) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Send {
                destination: destination.to_string(),
                reason: "transacted producer is closed".to_string(),
            });
        }
        self.buffer.lock().push((message, destination.clone()));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.buffer.lock().clear();
    }
}

#[async_trait]
impl TransactedProducer for InMemoryTransactedProducer {
    async fn commit(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Commit(
                "transacted producer is closed".to_string(),
            ));
        }
        let staged = std::mem::take(&mut *self.buffer.lock());
        for (message, destination) in staged {
            let queue = self.core.queue(&destination.name);
            self.core.deliver(
                &queue,
                StoredMessage {
                    id: next_message_id(),
                    payload: message.payload,
                    headers: message.headers,
                    delivery_count: 1,
                },
            );
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.buffer.lock().clear();
        Ok(())
    }
}

/// In-process transport backed by named queues.
#[derive(Clone)]
pub struct InMemoryTransport {
    core: Arc<TransportCore>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::with_supported_outcomes(vec![
            SettlementOutcome::Accepted,
            SettlementOutcome::Failed,
            SettlementOutcome::Rejected,
        ])
    }

    /// Restrict the outcomes this transport claims to support. Channel
    /// creation requiring an unsupported outcome fails.
    pub fn with_supported_outcomes(outcomes: Vec<SettlementOutcome>) -> Self {
        Self {
            core: Arc::new(TransportCore {
                queues: Mutex::new(HashMap::new()),
                dead_letter_routes: Mutex::new(HashMap::new()),
                supported_outcomes: outcomes,
            }),
        }
    }

    pub fn provision_queue(&self, name: &str) {
        let _ = self.core.queue(name);
    }

    /// Route messages REJECTED off `endpoint` into `dead_letter_queue`.
    pub fn set_dead_letter_route(&self, endpoint: &str, dead_letter_queue: &str) {
        self.core
            .dead_letter_routes
            .lock()
            .insert(endpoint.to_string(), dead_letter_queue.to_string());
    }

    /// Seed a message directly onto a queue (test/bootstrap helper).
    pub fn seed(&self, queue: &str, payload: Bytes) -> String {
        let id = next_message_id();
        let target = self.core.queue(queue);
        self.core.deliver(
            &target,
            StoredMessage {
                id: id.clone(),
                payload,
                headers: HashMap::new(),
                delivery_count: 1,
            },
        );
        id
    }

    pub fn queue_depth(&self, name: &str) -> usize {
        self.core.queue(name).messages.lock().len()
    }

    pub fn snapshot(&self, name: &str) -> Vec<QueuedMessage> {
        self.core
            .queue(name)
            .messages
            .lock()
            .iter()
            .map(|stored| QueuedMessage {
                id: stored.id.clone(),
                payload: stored.payload.clone(),
                headers: stored.headers.clone(),
                delivery_count: stored.delivery_count,
            })
            .collect()
    }

    /// Fire a flow event at every channel ever bound to `endpoint`.
    pub fn fire_flow_event(&self, endpoint: &str, event: FlowEvent) {
        let listeners = self.core.queue(endpoint).event_listeners.lock().clone();
        for listener in listeners {
            listener.on_flow_event(event);
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn create_channel(
        &self,
        endpoint: &EndpointDescriptor,
        config: ChannelConfig,
        events: Arc<dyn FlowEventListener>,
    ) -> Result<Arc<dyn ReceiveChannel>> {
        for outcome in &config.required_outcomes {
            if !self.core.supported_outcomes.contains(outcome) {
                return Err(TransportError::OutcomeNotSupported(*outcome));
            }
        }
        let queue = self.core.queue(&endpoint.name);
        if let Some(listener) = config.push_listener {
            *queue.push.lock() = Some(listener);
            // Drain anything already queued through the push path.
            let backlog = std::mem::take(&mut *queue.messages.lock());
            for stored in backlog {
                self.core.deliver(&queue, stored);
            }
        }
        queue.event_listeners.lock().push(Arc::clone(&events));
        events.on_flow_event(FlowEvent::Up);
        Ok(Arc::new(InMemoryChannel {
            core: Arc::clone(&self.core),
            queue,
            started: AtomicBool::new(config.start_running),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_producer(&self) -> Result<Arc<dyn ProducerChannel>> {
        Ok(Arc::new(InMemoryProducer {
            core: Arc::clone(&self.core),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_transacted_producer(&self) -> Result<Arc<dyn TransactedProducer>> {
        Ok(Arc::new(InMemoryTransactedProducer {
            core: Arc::clone(&self.core),
            buffer: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}
