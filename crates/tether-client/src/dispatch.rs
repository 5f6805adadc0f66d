// Decouples message arrival from application processing. One listener
// task drains the flow and hands each message to a pool of worker tasks
// through a capacity-1 rendezvous channel with a bounded wait; a watchdog
// task warns about messages a worker has been holding for too long.
use crate::error::ClientError;
use crate::flow::{FlowReceiverContainer, MessageContainer};
use crate::telemetry::{t_counter, t_gauge};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Application consumer. Invoked once per message by a worker task; a
/// returned error (or a panic) routes the message to the error handler.
pub type ConsumerFn =
    Arc<dyn Fn(Arc<MessageContainer>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Terminal error path for a message whose consumer failed. Implementations
/// must leave the container settled one way or another.
#[async_trait]
pub trait ProcessingErrorHandler: Send + Sync {
    async fn on_error(&self, container: Arc<MessageContainer>, error: anyhow::Error);
}

/// Fallback error handler: settle FAILED so the broker redelivers.
pub struct RequeueErrorHandler {
    flow: Arc<FlowReceiverContainer>,
}

impl RequeueErrorHandler {
    pub fn new(flow: Arc<FlowReceiverContainer>) -> Self {
        Self { flow }
    }
}

#[async_trait]
impl ProcessingErrorHandler for RequeueErrorHandler {
    async fn on_error(&self, container: Arc<MessageContainer>, error: anyhow::Error) {
        tracing::warn!(
            message = container.message().id(),
            error = %error,
            "consumer failed, requeueing message"
        );
        if let Err(err) = self.flow.requeue(&container).await {
            tracing::error!(
                message = container.message().id(),
                error = %err,
                "failed to requeue message after consumer error"
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub worker_count: usize,
    /// Max time the listener waits for a worker to claim a message before
    /// settling it FAILED.
    pub handoff_timeout: Duration,
    /// Per-message processing time past which the watchdog warns.
    pub max_processing_time: Duration,
}

impl From<&crate::config::EngineConfig> for DispatchConfig {
    fn from(config: &crate::config::EngineConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            handoff_timeout: Duration::from_millis(config.handoff_timeout_ms),
            max_processing_time: Duration::from_millis(config.max_processing_time_ms),
        }
    }
}

// Claim-poll slice; workers and the listener re-check the cancel flag at
// least this often.
const POLL_SLICE: Duration = Duration::from_secs(1);
// Lower bound on the watchdog sleep.
const WATCHDOG_FLOOR: Duration = Duration::from_millis(10);
const ESCALATION_FACTOR: u32 = 10;
const ID_RING_CAPACITY: usize = 128;

pub(crate) struct InFlightRecord {
    pub(crate) message_id: String,
    pub(crate) started: Instant,
    pub(crate) warned: bool,
    pub(crate) escalated: bool,
}

#[derive(Default)]
pub struct DispatchStats {
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    unclaimed: AtomicU64,
    watchdog_warnings: AtomicU64,
    watchdog_escalations: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub unclaimed: u64,
    pub watchdog_warnings: u64,
    pub watchdog_escalations: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unclaimed: self.unclaimed.load(Ordering::Relaxed),
            watchdog_warnings: self.watchdog_warnings.load(Ordering::Relaxed),
            watchdog_escalations: self.watchdog_escalations.load(Ordering::Relaxed),
        }
    }
}

// Recent message ids, kept for post-mortem logging only.
struct MessageIdRing {
    slots: Mutex<VecDeque<String>>,
}

impl MessageIdRing {
    fn new() -> Self {
        Self {
            slots: Mutex::new(VecDeque::with_capacity(ID_RING_CAPACITY)),
        }
    }

    fn record(&self, id: &str) {
        let mut slots = self.slots.lock();
        if slots.len() == ID_RING_CAPACITY {
            slots.pop_front();
        }
        slots.push_back(id.to_string());
    }

    fn recent(&self) -> Vec<String> {
        self.slots.lock().iter().cloned().collect()
    }
}

/// One scan over the in-flight records.
///
/// Warns once per record past `threshold`, escalates once past
/// 10x `threshold`, and returns how long the watchdog should sleep before
/// the next scan: the soonest upcoming warning or escalation deadline,
/// floored at 10ms, defaulting to half the threshold when nothing is
/// pending.
pub(crate) fn scan_in_flight(
    records: &mut HashMap<u64, InFlightRecord>,
    now: Instant,
    threshold: Duration,
    stats: &DispatchStats,
) -> Duration {
    let mut next_sleep = std::cmp::max(threshold / 2, WATCHDOG_FLOOR);
    let escalation = threshold * ESCALATION_FACTOR;
    for (sequence, record) in records.iter_mut() {
        let elapsed = now.saturating_duration_since(record.started);
        if !record.warned && elapsed >= threshold {
            record.warned = true;
            stats.watchdog_warnings.fetch_add(1, Ordering::Relaxed);
            t_counter!("tether_watchdog_warnings_total").increment(1);
            tracing::warn!(
                sequence = *sequence,
                message = %record.message_id,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "message processing exceeded the configured threshold"
            );
        }
        if !record.escalated && elapsed >= escalation {
            record.escalated = true;
            stats.watchdog_escalations.fetch_add(1, Ordering::Relaxed);
            t_counter!("tether_watchdog_escalations_total").increment(1);
            tracing::error!(
                sequence = *sequence,
                message = %record.message_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "message processing exceeded 10x the configured threshold"
            );
        }
        let upcoming = if !record.warned {
            Some(threshold.saturating_sub(elapsed))
        } else if !record.escalated {
            Some(escalation.saturating_sub(elapsed))
        } else {
            None
        };
        if let Some(until) = upcoming {
            // +1ms so the deadline has passed when the scan wakes up.
            let candidate = std::cmp::max(until + Duration::from_millis(1), WATCHDOG_FLOOR);
            next_sleep = std::cmp::min(next_sleep, candidate);
        }
    }
    next_sleep
}

/// Supervised worker pool for one consumer binding.
///
/// `start` spawns the listener, `worker_count` workers, and the watchdog;
/// `shutdown` flips a shared cancel flag and waits for all of them. In-
/// flight work finishes naturally.
pub struct DispatchSupervisor {
    flow: Arc<FlowReceiverContainer>,
    cancel: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<DispatchStats>,
    id_ring: Arc<MessageIdRing>,
    tx: mpsc::Sender<Arc<MessageContainer>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<MessageContainer>>>>,
    handoff_timeout: Duration,
}

impl DispatchSupervisor {
    pub fn start(
        flow: Arc<FlowReceiverContainer>,
        consumer: ConsumerFn,
        error_handler: Arc<dyn ProcessingErrorHandler>,
        config: DispatchConfig,
    ) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let stats = Arc::new(DispatchStats::default());
        let id_ring = Arc::new(MessageIdRing::new());
        let in_flight: Arc<Mutex<HashMap<u64, InFlightRecord>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let next_sequence = Arc::new(AtomicU64::new(0));
        // Capacity 1 is the smallest tokio allows; send_timeout on a full
        // channel gives the rendezvous-with-bounded-wait behavior.
        let (tx, rx) = mpsc::channel::<Arc<MessageContainer>>(1);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(config.worker_count + 2);
        handles.push(tokio::spawn(listener_loop(
            Arc::clone(&flow),
            tx.clone(),
            config.handoff_timeout,
            Arc::clone(&stats),
            cancel_rx.clone(),
        )));
        for worker in 0..config.worker_count {
            handles.push(tokio::spawn(worker_loop(
                worker,
                Arc::clone(&flow),
                Arc::clone(&rx),
                Arc::clone(&consumer),
                Arc::clone(&error_handler),
                Arc::clone(&in_flight),
                Arc::clone(&next_sequence),
                Arc::clone(&stats),
                Arc::clone(&id_ring),
                cancel_rx.clone(),
            )));
        }
        handles.push(tokio::spawn(watchdog_loop(
            Arc::clone(&in_flight),
            config.max_processing_time,
            Arc::clone(&stats),
            cancel_rx,
        )));

        Self {
            flow,
            cancel,
            handles,
            stats,
            id_ring,
            tx,
            rx,
            handoff_timeout: config.handoff_timeout,
        }
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn recent_message_ids(&self) -> Vec<String> {
        self.id_ring.recent()
    }

    /// Arrival-callback entry point for push-mode transports. Messages the
    /// transport pushes land in the same rendezvous slot the polling
    /// listener feeds, under the same bounded-wait policy. Pass the result
    /// to [`FlowReceiverContainer::bind_push`].
    pub fn arrival_listener(&self) -> Arc<ArrivalListener> {
        Arc::new(ArrivalListener {
            flow: Arc::clone(&self.flow),
            tx: self.tx.clone(),
            handoff_timeout: self.handoff_timeout,
            stats: Arc::clone(&self.stats),
        })
    }

    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "dispatch task ended abnormally");
            }
        }
        // The rendezvous slot can still hold a message handed off after the
        // workers observed the cancel flag. It has been claimed off the
        // endpoint, so it must be given a disposition before the container
        // is dropped.
        let mut rx = self.rx.lock().await;
        while let Ok(container) = rx.try_recv() {
            self.stats.unclaimed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                message = container.message().id(),
                "requeueing message left unclaimed in the handoff slot at shutdown"
            );
            if let Err(err) = self.flow.requeue(&container).await {
                tracing::error!(
                    message = container.message().id(),
                    error = %err,
                    "failed to requeue unclaimed message at shutdown"
                );
            }
        }
        tracing::info!("dispatch supervisor stopped");
    }
}

/// Bridges a transport's push delivery into the supervisor's rendezvous
/// channel.
pub struct ArrivalListener {
    flow: Arc<FlowReceiverContainer>,
    tx: mpsc::Sender<Arc<MessageContainer>>,
    handoff_timeout: Duration,
    stats: Arc<DispatchStats>,
}

#[async_trait]
impl tether_transport::MessageListener for ArrivalListener {
    async fn on_message(&self, message: tether_transport::InboundMessage) {
        let container = match self.flow.adopt(message.clone()) {
            Ok(container) => Arc::new(container),
            Err(err) => {
                // Pushed while unbound; put it back so the next generation
                // sees it.
                tracing::warn!(
                    message = message.id(),
                    error = %err,
                    "pushed message arrived without a bound generation, requeueing"
                );
                if let Err(err) = message
                    .settle(tether_transport::SettlementOutcome::Failed)
                    .await
                {
                    tracing::error!(
                        message = message.id(),
                        error = %err,
                        "failed to requeue pushed message"
                    );
                }
                return;
            }
        };
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        hand_off(
            &self.flow,
            &self.tx,
            container,
            self.handoff_timeout,
            &self.stats,
        )
        .await;
    }
}

// Bounded-wait rendezvous: an unclaimed message goes back on the endpoint.
async fn hand_off(
    flow: &Arc<FlowReceiverContainer>,
    tx: &mpsc::Sender<Arc<MessageContainer>>,
    container: Arc<MessageContainer>,
    handoff_timeout: Duration,
    stats: &DispatchStats,
) -> bool {
    match tx.send_timeout(container, handoff_timeout).await {
        Ok(()) => true,
        Err(SendTimeoutError::Timeout(container)) => {
            // No worker claimed the message in time. This is local
            // backpressure, not a processing verdict, so put the message
            // back on the endpoint.
            stats.unclaimed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                message = container.message().id(),
                timeout_ms = handoff_timeout.as_millis() as u64,
                "no worker claimed message within the handoff timeout, requeueing"
            );
            if let Err(err) = flow.requeue(&container).await {
                tracing::error!(
                    message = container.message().id(),
                    error = %err,
                    "failed to requeue unclaimed message"
                );
            }
            true
        }
        Err(SendTimeoutError::Closed(_)) => false,
    }
}

async fn listener_loop(
    flow: Arc<FlowReceiverContainer>,
    tx: mpsc::Sender<Arc<MessageContainer>>,
    handoff_timeout: Duration,
    stats: Arc<DispatchStats>,
    cancel_rx: watch::Receiver<bool>,
) {
    while !*cancel_rx.borrow() {
        let container = match flow.receive(Some(POLL_SLICE)).await {
            Ok(Some(container)) => container,
            Ok(None) => continue,
            Err(ClientError::NotBound(_)) => {
                // Between unbind and rebind; back off until the flow exists
                // again.
                tokio::time::sleep(POLL_SLICE).await;
                continue;
            }
            Err(err) => {
                tracing::warn!(error = %err, "receive failed, backing off");
                tokio::time::sleep(POLL_SLICE).await;
                continue;
            }
        };
        stats.dispatched.fetch_add(1, Ordering::Relaxed);
        if !hand_off(&flow, &tx, Arc::new(container), handoff_timeout, &stats).await {
            break;
        }
    }
    tracing::debug!("dispatch listener stopped");
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker: usize,
    flow: Arc<FlowReceiverContainer>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<MessageContainer>>>>,
    consumer: ConsumerFn,
    error_handler: Arc<dyn ProcessingErrorHandler>,
    in_flight: Arc<Mutex<HashMap<u64, InFlightRecord>>>,
    next_sequence: Arc<AtomicU64>,
    stats: Arc<DispatchStats>,
    id_ring: Arc<MessageIdRing>,
    cancel_rx: watch::Receiver<bool>,
) {
    while !*cancel_rx.borrow() {
        let claimed = {
            let mut rx = rx.lock().await;
            // Bounded claim slice so the cancel flag is observed even when
            // no messages arrive.
            tokio::time::timeout(POLL_SLICE, rx.recv()).await
        };
        let container = match claimed {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(container)) => container,
        };

        let sequence = next_sequence.fetch_add(1, Ordering::Relaxed);
        id_ring.record(container.message().id());
        {
            let mut records = in_flight.lock();
            records.insert(
                sequence,
                InFlightRecord {
                    message_id: container.message().id().to_string(),
                    started: Instant::now(),
                    warned: false,
                    escalated: false,
                },
            );
            t_gauge!("tether_in_flight_messages").set(records.len() as f64);
        }

        let outcome = AssertUnwindSafe(consumer(Arc::clone(&container)))
            .catch_unwind()
            .await;
        {
            let mut records = in_flight.lock();
            records.remove(&sequence);
            t_gauge!("tether_in_flight_messages").set(records.len() as f64);
        }

        match outcome {
            Ok(Ok(())) => {
                stats.succeeded.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = flow.acknowledge(&container).await {
                    tracing::error!(
                        worker,
                        message = container.message().id(),
                        error = %err,
                        "failed to acknowledge processed message"
                    );
                }
            }
            Ok(Err(error)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error_handler.on_error(container, error).await;
            }
            Err(panic) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(worker, panic = %detail, "consumer panicked");
                error_handler
                    .on_error(container, anyhow::anyhow!("consumer panicked: {detail}"))
                    .await;
            }
        }
    }
    tracing::debug!(worker, "dispatch worker stopped");
}

async fn watchdog_loop(
    in_flight: Arc<Mutex<HashMap<u64, InFlightRecord>>>,
    threshold: Duration,
    stats: Arc<DispatchStats>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        let sleep = {
            let mut records = in_flight.lock();
            scan_in_flight(&mut records, Instant::now(), threshold, &stats)
        };
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(sleep) => {}
        }
    }
    tracing::debug!("dispatch watchdog stopped");
}
