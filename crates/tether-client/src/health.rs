// Health reporting seam. The engine reports up/reconnecting/down
// transitions into a sink and never blocks on it; the default sink just
// logs.
use crate::reconnect::SessionEventObserver;
use parking_lot::Mutex;
use std::sync::Arc;
use tether_transport::{FlowEvent, FlowEventListener, SessionEvent};

pub trait HealthSink: Send + Sync {
    fn up(&self);
    fn reconnecting(&self);
    fn down(&self);
}

/// Log-only sink used when no health infrastructure is wired in.
pub struct TracingHealthSink {
    scope: String,
}

impl TracingHealthSink {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
        }
    }
}

impl HealthSink for TracingHealthSink {
    fn up(&self) {
        tracing::info!(scope = %self.scope, "health up");
    }

    fn reconnecting(&self) {
        tracing::warn!(scope = %self.scope, "health reconnecting");
    }

    fn down(&self) {
        tracing::warn!(scope = %self.scope, "health down");
    }
}

/// Routes flow events into the binding's health sink and runs flow-scoped
/// reconnect listeners once the flow is usable again.
pub struct FlowHealthListener {
    binding_name: String,
    sink: Arc<dyn HealthSink>,
    reconnect_listeners: Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>,
}

impl FlowHealthListener {
    pub fn new(binding_name: impl Into<String>, sink: Arc<dyn HealthSink>) -> Self {
        Self {
            binding_name: binding_name.into(),
            sink,
            reconnect_listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_reconnect_listener(&self, listener: Arc<dyn Fn() + Send + Sync>) {
        self.reconnect_listeners.lock().push(listener);
    }

    pub fn clear_reconnect_listeners(&self) {
        self.reconnect_listeners.lock().clear();
    }
}

impl FlowEventListener for FlowHealthListener {
    fn on_flow_event(&self, event: FlowEvent) {
        tracing::debug!(binding = %self.binding_name, ?event, "flow event");
        match event {
            FlowEvent::Down => self.sink.down(),
            FlowEvent::Reconnecting => self.sink.reconnecting(),
            FlowEvent::Up | FlowEvent::Reconnected => {
                self.sink.up();
                let listeners = self.reconnect_listeners.lock().clone();
                for listener in listeners {
                    listener();
                }
            }
            FlowEvent::Inactive => {
                tracing::info!(binding = %self.binding_name, "flow inactive");
            }
            FlowEvent::Unhandled => {
                tracing::debug!(binding = %self.binding_name, "unhandled flow event");
            }
        }
    }
}

/// Maps session events onto the session-wide health sink.
pub struct SessionHealthObserver {
    sink: Arc<dyn HealthSink>,
}

impl SessionHealthObserver {
    pub fn new(sink: Arc<dyn HealthSink>) -> Self {
        Self { sink }
    }
}

impl SessionEventObserver for SessionHealthObserver {
    fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Reconnected => self.sink.up(),
            SessionEvent::Reconnecting => self.sink.reconnecting(),
            SessionEvent::Down => self.sink.down(),
            SessionEvent::Unhandled => {
                tracing::debug!("unhandled session event");
            }
        }
    }
}
