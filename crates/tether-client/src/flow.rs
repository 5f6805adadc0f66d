// A receive-channel wrapper that tolerates live rebinds. Messaging
// operations invoked through this object while a rebind is in progress are
// not corrupted by it: the admin lock serializes bind/unbind/pause/resume,
// and the generation's shared stale flag lets already-handed-out messages
// (and any task blocked in receive) detect the rebind without ever taking
// that lock.
use crate::error::{ClientError, Result};
use crate::health::FlowHealthListener;
use crate::telemetry::t_counter;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_transport::{
    ChannelConfig, EndpointDescriptor, FlowEventListener, InboundMessage, MessageListener,
    ReceiveChannel, SettlementOutcome, Transport,
};
use uuid::Uuid;

/// One received message tagged with the flow generation that produced it.
///
/// The settle-once guard lives here: whichever caller first settles the
/// container wins, all later settlement calls are no-ops.
#[derive(Debug)]
pub struct MessageContainer {
    message: InboundMessage,
    generation_id: u64,
    stale: Arc<AtomicBool>,
    acknowledged: AtomicBool,
}

impl MessageContainer {
    fn new(message: InboundMessage, generation_id: u64, stale: Arc<AtomicBool>) -> Self {
        Self {
            message,
            generation_id,
            stale,
            acknowledged: AtomicBool::new(false),
        }
    }

    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    /// Id of the generation this message was received under. This is a
    /// container-local reference id, not any broker-side flow id; broker
    /// flow ids can change transparently on reconnect.
    pub fn generation_id(&self) -> u64 {
        self.generation_id
    }

    /// True once the producing generation has been unbound or rebound.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }

    fn try_begin_settle(&self) -> bool {
        self.acknowledged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn abort_settle(&self) {
        self.acknowledged.store(false, Ordering::Release);
    }
}

struct BoundFlow {
    generation_id: u64,
    stale: Arc<AtomicBool>,
    channel: Arc<dyn ReceiveChannel>,
}

/// Owns one logical flow (a subscription-backed receive channel) and lets
/// it be bound, unbound, rebound, paused, and resumed while serving
/// receive/settlement traffic.
pub struct FlowReceiverContainer {
    id: Uuid,
    endpoint: EndpointDescriptor,
    transport: Arc<dyn Transport>,
    bound: ArcSwapOption<BoundFlow>,
    paused: AtomicBool,
    next_generation: AtomicU64,
    // Serializes the rare state-transitioning operations (bind, unbind,
    // pause, resume). receive and settlement deliberately stay off this
    // lock so steady-state traffic is never queued behind admin work.
    admin_lock: tokio::sync::Mutex<()>,
    events: Arc<FlowHealthListener>,
}

impl FlowReceiverContainer {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: EndpointDescriptor,
        events: Arc<FlowHealthListener>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            transport,
            bound: ArcSwapOption::const_empty(),
            paused: AtomicBool::new(false),
            next_generation: AtomicU64::new(0),
            admin_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint.name
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load().is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Create the receive channel and remember it as the live generation.
    ///
    /// Idempotent: if a generation is already live its id is returned and
    /// no new transport object is created. On channel-creation failure the
    /// container stays unbound.
    pub async fn bind(&self) -> Result<u64> {
        self.bind_with(None).await
    }

    /// Like [`bind`](Self::bind), but the transport pushes arriving
    /// messages to `listener` instead of queueing them for `receive`.
    pub async fn bind_push(&self, listener: Arc<dyn MessageListener>) -> Result<u64> {
        self.bind_with(Some(listener)).await
    }

    async fn bind_with(&self, push_listener: Option<Arc<dyn MessageListener>>) -> Result<u64> {
        let _guard = self.admin_lock.lock().await;
        if let Some(existing) = self.bound.load_full() {
            tracing::info!(
                container = %self.id,
                generation = existing.generation_id,
                "flow receiver container is already bound"
            );
            return Ok(existing.generation_id);
        }
        let paused = self.paused.load(Ordering::Acquire);
        tracing::info!(
            container = %self.id,
            endpoint = %self.endpoint.name,
            state = if paused { "paused" } else { "running" },
            "binding flow receiver container"
        );
        let config = ChannelConfig {
            start_running: !paused,
            required_outcomes: vec![
                SettlementOutcome::Accepted,
                SettlementOutcome::Failed,
                SettlementOutcome::Rejected,
            ],
            push_listener,
        };
        let events: Arc<dyn FlowEventListener> = Arc::clone(&self.events) as _;
        let channel = self
            .transport
            .create_channel(&self.endpoint, config, events)
            .await?;
        let generation_id = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.bound.store(Some(Arc::new(BoundFlow {
            generation_id,
            stale: Arc::new(AtomicBool::new(false)),
            channel,
        })));
        Ok(generation_id)
    }

    /// Close the bound channel. All containers handed out under the current
    /// generation become stale; a task blocked in `receive` returns instead
    /// of hanging. No-op when already unbound.
    pub async fn unbind(&self) {
        let _guard = self.admin_lock.lock().await;
        if let Some(flow) = self.bound.swap(None) {
            tracing::info!(
                container = %self.id,
                generation = flow.generation_id,
                "unbinding flow receiver container"
            );
            flow.stale.store(true, Ordering::Release);
            flow.channel.close().await;
        }
    }

    /// Close and recreate the receive channel, minting a fresh generation.
    pub async fn rebind(&self) -> Result<u64> {
        self.unbind().await;
        self.bind().await
    }

    /// Receive the next available message.
    ///
    /// `None` waits forever, `Some(Duration::ZERO)` polls, anything else
    /// waits up to that long. Returns `Ok(None)` on timeout or when the
    /// channel is closed mid-receive. Not safe for concurrent invocation;
    /// parallelism is achieved across containers, not within one.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Option<MessageContainer>> {
        let Some(flow) = self.bound.load_full() else {
            return Err(ClientError::NotBound(self.id));
        };
        // Deliberately no admin lock here: a concurrent unbind closes the
        // channel, which makes this call return rather than block on it.
        let received = flow.channel.receive(timeout).await?;
        Ok(received.map(|message| {
            t_counter!("tether_messages_received_total").increment(1);
            MessageContainer::new(message, flow.generation_id, Arc::clone(&flow.stale))
        }))
    }

    /// Tag a message the transport pushed out-of-band with the live
    /// generation. Fails with `NotBound` when no generation exists to own
    /// it.
    pub fn adopt(&self, message: InboundMessage) -> Result<MessageContainer> {
        let Some(flow) = self.bound.load_full() else {
            return Err(ClientError::NotBound(self.id));
        };
        t_counter!("tether_messages_received_total").increment(1);
        Ok(MessageContainer::new(
            message,
            flow.generation_id,
            Arc::clone(&flow.stale),
        ))
    }

    /// Settle the message ACCEPTED and mark the container acknowledged.
    pub async fn acknowledge(&self, container: &MessageContainer) -> Result<()> {
        self.settle(container, SettlementOutcome::Accepted, "ACK")
            .await
    }

    /// Settle the message FAILED: the application could not process it and
    /// the broker should redeliver (possibly delayed, possibly dead-lettered
    /// broker-side once its own redelivery limit is hit).
    pub async fn requeue(&self, container: &MessageContainer) -> Result<()> {
        self.settle(container, SettlementOutcome::Failed, "REQUEUE")
            .await
    }

    /// Settle the message REJECTED: the message itself is invalid. It will
    /// not be redelivered; the broker moves it to the dead-letter queue or
    /// discards it.
    pub async fn reject(&self, container: &MessageContainer) -> Result<()> {
        self.settle(container, SettlementOutcome::Rejected, "REJECT")
            .await
    }

    async fn settle(
        &self,
        container: &MessageContainer,
        outcome: SettlementOutcome,
        action: &'static str,
    ) -> Result<()> {
        if container.is_acknowledged() {
            return Ok(());
        }
        if container.is_stale() {
            // The flow this message arrived on no longer exists; settling it
            // against the current generation would acknowledge the wrong
            // delivery.
            return Err(ClientError::StaleGeneration(container.generation_id()));
        }
        if !container.try_begin_settle() {
            return Ok(());
        }
        if let Err(source) = container.message().settle(outcome).await {
            // Leave the container settleable so the error path can still
            // requeue or dead-letter it.
            container.abort_settle();
            return Err(ClientError::Settlement { action, source });
        }
        match outcome {
            SettlementOutcome::Accepted => {
                t_counter!("tether_messages_settled_total", "outcome" => "accepted").increment(1)
            }
            SettlementOutcome::Failed => {
                t_counter!("tether_messages_settled_total", "outcome" => "failed").increment(1)
            }
            SettlementOutcome::Rejected => {
                t_counter!("tether_messages_settled_total", "outcome" => "rejected").increment(1)
            }
        };
        Ok(())
    }

    /// Stop the live channel (if any) and remember the desired pause state
    /// for future binds.
    pub async fn pause(&self) {
        let _guard = self.admin_lock.lock().await;
        tracing::info!(container = %self.id, "pausing flow receiver container");
        if let Some(flow) = self.bound.load_full() {
            if let Err(err) = flow.channel.stop().await {
                tracing::warn!(container = %self.id, error = %err, "failed to stop channel");
            }
        }
        self.paused.store(true, Ordering::Release);
    }

    /// Start the live channel (if any) and clear the desired pause state.
    /// Resuming a never-bound container only affects the next `bind`.
    pub async fn resume(&self) -> Result<()> {
        let _guard = self.admin_lock.lock().await;
        tracing::info!(container = %self.id, "resuming flow receiver container");
        if let Some(flow) = self.bound.load_full() {
            flow.channel.start().await?;
        }
        self.paused.store(false, Ordering::Release);
        Ok(())
    }
}
