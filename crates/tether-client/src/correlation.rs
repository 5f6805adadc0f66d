// Publish-side correlation. Every outbound message travels with a
// correlation key; the transport (or the transaction boundary) resolves it
// exactly once with success or failure. Keys are shared across legs of a
// batch, so failures are passed around as `Arc<ClientError>`.
use crate::error::ClientError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tether_transport::{Destination, OutboundMessage};
use tokio::sync::oneshot;

/// Outcome of one publish request as seen by its correlation key.
pub type PublishResult = std::result::Result<(), Arc<ClientError>>;

/// Resolved exactly once per publish request.
#[async_trait]
pub trait CorrelationKey: Send + Sync {
    async fn on_success(&self);

    async fn on_failure(&self, error: Arc<ClientError>);
}

/// Builds a linked resolver/handle pair. The resolver side is attached to
/// a publish request; the handle side is awaited by the caller that wants
/// a per-request confirmation.
pub fn confirm_pair() -> (ConfirmResolver, ConfirmHandle) {
    let (tx, rx) = oneshot::channel();
    (
        ConfirmResolver {
            tx: Mutex::new(Some(tx)),
        },
        ConfirmHandle { rx },
    )
}

/// Write side of a confirmation. Firing twice is a no-op; firing with no
/// listener left is fine.
pub struct ConfirmResolver {
    tx: Mutex<Option<oneshot::Sender<PublishResult>>>,
}

impl ConfirmResolver {
    pub fn resolve(&self, result: PublishResult) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(result);
        }
    }
}

/// Caller-side awaitable confirmation for one publish request.
pub struct ConfirmHandle {
    rx: oneshot::Receiver<PublishResult>,
}

impl ConfirmHandle {
    /// Waits for the request to be confirmed or failed. Returns
    /// `ConfirmDropped` if the publisher was torn down before resolving.
    pub async fn wait(self) -> PublishResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Arc::new(ClientError::ConfirmDropped)),
        }
    }
}

/// Report handed to the error sink when a publish leg fails.
pub struct PublishErrorReport {
    pub destination: Destination,
    pub message: OutboundMessage,
    pub error: Arc<ClientError>,
}

/// Terminal consumer of publish failures, typically a binding's error
/// channel. Must not block.
pub trait PublishErrorSink: Send + Sync {
    fn on_publish_error(&self, report: PublishErrorReport);
}

/// Standard per-message key: routes failures to the error sink (when one
/// is configured) and resolves the caller's confirmation either way.
pub struct ErrorRoutingCorrelationKey {
    message: OutboundMessage,
    destination: Destination,
    error_sink: Option<Arc<dyn PublishErrorSink>>,
    confirm: Option<ConfirmResolver>,
}

impl ErrorRoutingCorrelationKey {
    pub fn new(
        message: OutboundMessage,
        destination: Destination,
        error_sink: Option<Arc<dyn PublishErrorSink>>,
        confirm: Option<ConfirmResolver>,
    ) -> Self {
        Self {
            message,
            destination,
            error_sink,
            confirm,
        }
    }
}

#[async_trait]
impl CorrelationKey for ErrorRoutingCorrelationKey {
    async fn on_success(&self) {
        if let Some(confirm) = &self.confirm {
            confirm.resolve(Ok(()));
        }
    }

    async fn on_failure(&self, error: Arc<ClientError>) {
        tracing::warn!(
            destination = %self.destination,
            error = %error,
            "publish failed"
        );
        if let Some(sink) = &self.error_sink {
            sink.on_publish_error(PublishErrorReport {
                destination: self.destination.clone(),
                message: self.message.clone(),
                error: Arc::clone(&error),
            });
        }
        if let Some(confirm) = &self.confirm {
            confirm.resolve(Err(error));
        }
    }
}

/// Fans one logical key out across the legs of a non-transacted batch.
///
/// The wrapped key fires exactly once: with success after all expected
/// legs succeed, or with the first failure observed. Outcomes arriving
/// after resolution are dropped.
pub struct BatchProxyCorrelationKey {
    inner: Arc<dyn CorrelationKey>,
    expected: usize,
    successes: AtomicUsize,
    resolved: AtomicBool,
}

impl BatchProxyCorrelationKey {
    pub fn new(inner: Arc<dyn CorrelationKey>, expected: usize) -> Self {
        Self {
            inner,
            expected,
            successes: AtomicUsize::new(0),
            resolved: AtomicBool::new(false),
        }
    }

    fn try_resolve(&self) -> bool {
        self.resolved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[async_trait]
impl CorrelationKey for BatchProxyCorrelationKey {
    async fn on_success(&self) {
        let done = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
        if done >= self.expected && self.try_resolve() {
            self.inner.on_success().await;
        }
    }

    async fn on_failure(&self, error: Arc<ClientError>) {
        if self.try_resolve() {
            self.inner.on_failure(error).await;
        }
    }
}
