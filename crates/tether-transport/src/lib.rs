// Transport capability seam consumed by the tether client engine.
//
// The engine (tether-client) never talks to a broker SDK directly. It is
// written against the traits in this crate: a way to create a receive
// channel on an endpoint, to settle received messages, and to send
// (optionally transacted) outbound messages. A real broker adapter
// implements these traits; `inmemory` provides a faithful in-process
// implementation used by tests and embedders.
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod inmemory;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Terminal disposition communicated back to the broker for a received
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettlementOutcome {
    /// Message was processed; remove it from the endpoint.
    Accepted,
    /// Processing failed; the broker should redeliver.
    Failed,
    /// Message is undeliverable; move to the dead-letter queue (or drop).
    Rejected,
}

impl fmt::Display for SettlementOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementOutcome::Accepted => write!(f, "ACCEPTED"),
            SettlementOutcome::Failed => write!(f, "FAILED"),
            SettlementOutcome::Rejected => write!(f, "REJECTED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Topic,
    Queue,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Topic => write!(f, "TOPIC"),
            DestinationKind::Queue => write!(f, "QUEUE"),
        }
    }
}

/// A send target: a named topic or queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub kind: DestinationKind,
    pub name: String,
}

impl Destination {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            name: name.into(),
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            name: name.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// The subscription-backed endpoint a receive channel binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub name: String,
}

impl EndpointDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("failed to create receive channel on {endpoint}: {reason}")]
    ChannelCreation { endpoint: String, reason: String },
    #[error("settlement outcome {0} is not supported by this transport")]
    OutcomeNotSupported(SettlementOutcome),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("failed to settle message: {0}")]
    Settle(String),
    #[error("failed to send to {destination}: {reason}")]
    Send {
        destination: String,
        reason: String,
    },
    #[error("transaction commit failed: {0}")]
    Commit(String),
    #[error("transaction was rolled back: {0}")]
    RolledBack(String),
    #[error("transaction rollback failed: {0}")]
    Rollback(String),
    #[error("channel is closed")]
    Closed,
}

/// Settles one received message back to its broker-side endpoint.
///
/// Implementations must tolerate being called from any task; the
/// settle-once discipline is enforced by the engine above this seam.
#[async_trait]
pub trait MessageSettler: Send + Sync {
    async fn settle(&self, outcome: SettlementOutcome) -> Result<()>;
}

/// One message received from a channel, together with its settlement hook.
#[derive(Clone)]
pub struct InboundMessage {
    id: String,
    payload: Bytes,
    headers: HashMap<String, String>,
    delivery_count: u32,
    settler: Arc<dyn MessageSettler>,
}

impl InboundMessage {
    pub fn new(
        id: impl Into<String>,
        payload: Bytes,
        headers: HashMap<String, String>,
        delivery_count: u32,
        settler: Arc<dyn MessageSettler>,
    ) -> Self {
        Self {
            id: id.into(),
            payload,
            headers,
            delivery_count,
            settler,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// How many times the broker has delivered this message, starting at 1
    /// for the first delivery.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub async fn settle(&self, outcome: SettlementOutcome) -> Result<()> {
        self.settler.settle(outcome).await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// A message on its way out to the broker.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Events emitted by a receive channel ("flow") about its own health.
///
/// Future broker event kinds map to `Unhandled` so new variants are
/// compile-time visible to every exhaustive match in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEvent {
    Up,
    Reconnecting,
    Reconnected,
    Down,
    Inactive,
    Unhandled,
}

/// Events emitted by the broker session underneath all channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Reconnected,
    Reconnecting,
    Down,
    Unhandled,
}

/// Observer for flow events. Runs on a transport-owned task and must not
/// block.
pub trait FlowEventListener: Send + Sync {
    fn on_flow_event(&self, event: FlowEvent);
}

/// Push-mode delivery callback. The transport's arrival task awaits this;
/// implementations must bound how long they take (see the dispatch
/// supervisor's handoff timeout).
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: InboundMessage);
}

/// Per-channel creation options.
#[derive(Clone, Default)]
pub struct ChannelConfig {
    /// Initial start state. A channel created with `false` is bound but
    /// will not hand out messages until started.
    pub start_running: bool,
    /// Settlement outcomes the caller requires. Creation fails with
    /// `OutcomeNotSupported` if the transport cannot honor one of them.
    pub required_outcomes: Vec<SettlementOutcome>,
    /// When set, messages are pushed to this listener instead of being
    /// queued for `receive`.
    pub push_listener: Option<Arc<dyn MessageListener>>,
}

impl ChannelConfig {
    pub fn running() -> Self {
        Self {
            start_running: true,
            ..Default::default()
        }
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("start_running", &self.start_running)
            .field("required_outcomes", &self.required_outcomes)
            .field("push", &self.push_listener.is_some())
            .finish()
    }
}

/// A bound receive channel over one endpoint.
#[async_trait]
pub trait ReceiveChannel: Send + Sync {
    /// Receive the next message. `None` timeout blocks until a message
    /// arrives or the channel is closed; `Some(Duration::ZERO)` is a
    /// no-wait poll. Returns `Ok(None)` on timeout or close.
    async fn receive(&self, timeout: Option<Duration>) -> Result<Option<InboundMessage>>;

    /// Close the channel. Any task blocked in `receive` returns `Ok(None)`.
    async fn close(&self);

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn ReceiveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReceiveChannel")
    }
}

/// An outbound publish channel.
#[async_trait]
pub trait ProducerChannel: Send + Sync {
    async fn send(&self, message: OutboundMessage, destination: &Destination) -> Result<()>;

    async fn close(&self);
}

/// A producer whose sends take effect only at `commit`.
#[async_trait]
pub trait TransactedProducer: ProducerChannel {
    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}

/// The capability a broker adapter provides to the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_channel(
        &self,
        endpoint: &EndpointDescriptor,
        config: ChannelConfig,
        events: Arc<dyn FlowEventListener>,
    ) -> Result<Arc<dyn ReceiveChannel>>;

    async fn create_producer(&self) -> Result<Arc<dyn ProducerChannel>>;

    async fn create_transacted_producer(&self) -> Result<Arc<dyn TransactedProducer>>;
}
