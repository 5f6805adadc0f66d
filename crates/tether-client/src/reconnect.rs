// Session-level event plumbing. The broker session underneath every
// channel reports reconnects out-of-band; bindings register recovery work
// (rebinds, subscription re-application) here once and this registry runs
// it after each reconnect.
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_transport::SessionEvent;

/// An idempotent async recovery task. Tasks may run multiple times over
/// the life of a session and must converge to the same state each run.
pub type ReconnectTask = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Removal token returned by [`ReconnectTaskRegistry::register`]. Tasks are
/// removed by handle so they never need a self-reference to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReconnectTaskHandle(u64);

/// Receives every session event the registry sees. Runs on the session
/// event task and must not block.
pub trait SessionEventObserver: Send + Sync {
    fn on_session_event(&self, event: SessionEvent);
}

/// Concurrent registry of recovery tasks plus a fan-out of raw session
/// events to per-binding observers.
///
/// On `SessionEvent::Reconnected` each registered task is spawned,
/// best-effort: a task whose future resolves to an error is logged and
/// deregistered so a permanently broken recovery step cannot fire again
/// on every subsequent reconnect.
pub struct ReconnectTaskRegistry {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, ReconnectTask>>,
    observers: Mutex<Vec<Arc<dyn SessionEventObserver>>>,
    // Captured at construction; session-event callbacks arrive on
    // transport-owned threads that are not runtime workers.
    runtime: tokio::runtime::Handle,
}

impl ReconnectTaskRegistry {
    /// Must be called from within the tokio runtime.
    /// [`handle_session_event`](Self::handle_session_event) itself may then
    /// be invoked from any thread.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            tasks: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    pub fn register(&self, task: ReconnectTask) -> ReconnectTaskHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().insert(id, task);
        tracing::debug!(task = id, "registered reconnect task");
        ReconnectTaskHandle(id)
    }

    /// Returns false when the handle was already removed.
    pub fn unregister(&self, handle: ReconnectTaskHandle) -> bool {
        let removed = self.tasks.lock().remove(&handle.0).is_some();
        if removed {
            tracing::debug!(task = handle.0, "unregistered reconnect task");
        }
        removed
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn add_observer(&self, observer: Arc<dyn SessionEventObserver>) {
        self.observers.lock().push(observer);
    }

    /// Entry point for the transport's session event source.
    pub fn handle_session_event(self: &Arc<Self>, event: SessionEvent) {
        tracing::info!(?event, "session event");
        for observer in self.observers.lock().iter() {
            observer.on_session_event(event);
        }
        if event == SessionEvent::Reconnected {
            self.run_tasks();
        }
    }

    fn run_tasks(self: &Arc<Self>) {
        let snapshot: Vec<(u64, ReconnectTask)> = self
            .tasks
            .lock()
            .iter()
            .map(|(id, task)| (*id, Arc::clone(task)))
            .collect();
        tracing::info!(tasks = snapshot.len(), "running reconnect tasks");
        for (id, task) in snapshot {
            let registry = Arc::clone(self);
            self.runtime.spawn(async move {
                if let Err(err) = task().await {
                    tracing::warn!(task = id, error = %err, "reconnect task failed, deregistering");
                    registry.unregister(ReconnectTaskHandle(id));
                }
            });
        }
    }
}
