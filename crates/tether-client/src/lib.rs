// Broker-client delivery and publish engine.
//
// IMPORTANT DESIGN INTENT
// -----------------------
// This crate sits between an application and a broker transport and owns
// two hard problems the transport does not solve:
//
// - Consumer side: a receive channel ("flow") can be torn down and
//   recreated at any time, including while messages received from the old
//   channel are still being processed. Acknowledging such a message
//   against the new channel would settle the wrong delivery. Every
//   received message is therefore tagged with a generation; settlement
//   against a stale generation is refused, and settlement happens at most
//   once per message no matter how many code paths race to do it.
//
// - Producer side: a batch is one logical publish. Its correlation key
//   (and the caller's confirmation) fires exactly once, with success only
//   when every message made it, and under a transacted producer only at
//   the commit/rollback boundary.
//
// Parallelism is explicit: one listener task drains a flow, a fixed pool
// of worker tasks processes messages claimed from a capacity-1 rendezvous
// channel, and a watchdog task flags workers stuck on one message. We do
// not share a flow between concurrent receivers; scaling happens by
// adding bindings, not by racing on one.
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod error_queue;
pub mod flow;
pub mod health;
pub mod publish;
pub mod reconnect;

mod telemetry;

pub use config::EngineConfig;
pub use correlation::{
    confirm_pair, BatchProxyCorrelationKey, ConfirmHandle, ConfirmResolver, CorrelationKey,
    ErrorRoutingCorrelationKey, PublishErrorReport, PublishErrorSink, PublishResult,
};
pub use dispatch::{
    ArrivalListener, ConsumerFn, DispatchConfig, DispatchStatsSnapshot, DispatchSupervisor,
    ProcessingErrorHandler, RequeueErrorHandler,
};
pub use error::{ClientError, Result};
pub use error_queue::{
    error_queue_name, ErrorMessageHandler, ErrorQueueInfrastructure, RepublishCorrelationKey,
};
pub use flow::{FlowReceiverContainer, MessageContainer};
pub use health::{FlowHealthListener, HealthSink, SessionHealthObserver, TracingHealthSink};
pub use publish::{
    DeliveryMode, PublishRequest, PublisherOptions, TransactionalPublisher,
    TARGET_DESTINATION_HEADER,
};
pub use reconnect::{
    ReconnectTask, ReconnectTaskHandle, ReconnectTaskRegistry, SessionEventObserver,
};

#[cfg(test)]
mod tests;
