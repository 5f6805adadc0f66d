// Dead-letter republishing. A message that keeps failing is copied to the
// binding's error queue instead of being requeued forever; the container is
// settled off the outcome of that publish so the message exists on exactly
// one of the two queues.
use crate::config::EngineConfig;
use crate::correlation::CorrelationKey;
use crate::dispatch::ProcessingErrorHandler;
use crate::error::{ClientError, Result};
use crate::flow::{FlowReceiverContainer, MessageContainer};
use crate::telemetry::t_counter;
use async_trait::async_trait;
use std::sync::Arc;
use tether_transport::{Destination, OutboundMessage, ProducerChannel};

pub const ATTEMPTS_HEADER: &str = "x-delivery-attempts";
pub const SOURCE_ENDPOINT_HEADER: &str = "x-source-endpoint";

/// Error-queue name for an endpoint: the configured override, or
/// `<endpoint>.errors`.
pub fn error_queue_name(endpoint: &str, config: &EngineConfig) -> String {
    config
        .error_queue_name
        .clone()
        .unwrap_or_else(|| format!("{endpoint}.errors"))
}

/// Resolves a republished container off the publish outcome: the original
/// delivery is acknowledged only once the dead-letter copy is accepted,
/// otherwise it goes back on the source endpoint.
pub struct RepublishCorrelationKey {
    flow: Arc<FlowReceiverContainer>,
    container: Arc<MessageContainer>,
    error_queue: Destination,
}

impl RepublishCorrelationKey {
    pub fn new(
        flow: Arc<FlowReceiverContainer>,
        container: Arc<MessageContainer>,
        error_queue: Destination,
    ) -> Self {
        Self {
            flow,
            container,
            error_queue,
        }
    }
}

#[async_trait]
impl CorrelationKey for RepublishCorrelationKey {
    async fn on_success(&self) {
        tracing::info!(
            message = self.container.message().id(),
            error_queue = %self.error_queue,
            "message republished to error queue"
        );
        t_counter!("tether_messages_republished_total").increment(1);
        if let Err(err) = self.flow.acknowledge(&self.container).await {
            tracing::error!(
                message = self.container.message().id(),
                error = %err,
                "failed to acknowledge republished message"
            );
        }
    }

    async fn on_failure(&self, error: Arc<ClientError>) {
        tracing::warn!(
            message = self.container.message().id(),
            error_queue = %self.error_queue,
            error = %error,
            "error queue republish failed, requeueing original"
        );
        if let Err(err) = self.flow.requeue(&self.container).await {
            tracing::error!(
                message = self.container.message().id(),
                error = %err,
                "failed to requeue message after republish failure"
            );
        }
    }
}

/// Per-binding error queue: a producer pinned to one dead-letter queue plus
/// the delivery-attempt threshold.
pub struct ErrorQueueInfrastructure {
    producer: Arc<dyn ProducerChannel>,
    error_queue: Destination,
    max_delivery_attempts: u32,
}

impl ErrorQueueInfrastructure {
    pub fn new(
        producer: Arc<dyn ProducerChannel>,
        error_queue: Destination,
        max_delivery_attempts: u32,
    ) -> Self {
        Self {
            producer,
            error_queue,
            max_delivery_attempts,
        }
    }

    pub fn error_queue(&self) -> &Destination {
        &self.error_queue
    }

    /// Applies the republish policy to a failed message.
    ///
    /// Below the attempt threshold the container is requeued and the broker
    /// redelivers. At or above it, a dead-letter copy stamped with attempt
    /// metadata is published and the container is settled off that
    /// outcome. The container is never left unsettled.
    pub async fn republish_or_requeue(
        &self,
        flow: Arc<FlowReceiverContainer>,
        container: Arc<MessageContainer>,
    ) -> Result<()> {
        let attempts = container.message().delivery_count();
        if attempts < self.max_delivery_attempts {
            tracing::debug!(
                message = container.message().id(),
                attempts,
                max_attempts = self.max_delivery_attempts,
                "below the delivery-attempt threshold, requeueing"
            );
            return flow.requeue(&container).await;
        }

        let mut copy = OutboundMessage::new(container.message().payload().clone());
        copy.headers = container.message().headers().clone();
        copy.headers
            .insert(ATTEMPTS_HEADER.to_string(), attempts.to_string());
        copy.headers.insert(
            SOURCE_ENDPOINT_HEADER.to_string(),
            flow.endpoint_name().to_string(),
        );

        let key = RepublishCorrelationKey::new(flow, container, self.error_queue.clone());
        match self.producer.send(copy, &self.error_queue).await {
            Ok(()) => key.on_success().await,
            Err(err) => {
                key.on_failure(Arc::new(ClientError::Transport(err))).await;
            }
        }
        Ok(())
    }
}

/// Terminal error path for a consumer binding: republish through the error
/// queue when one is configured, plain requeue otherwise.
pub struct ErrorMessageHandler {
    flow: Arc<FlowReceiverContainer>,
    error_queue: Option<Arc<ErrorQueueInfrastructure>>,
}

impl ErrorMessageHandler {
    pub fn new(
        flow: Arc<FlowReceiverContainer>,
        error_queue: Option<Arc<ErrorQueueInfrastructure>>,
    ) -> Self {
        Self { flow, error_queue }
    }
}

#[async_trait]
impl ProcessingErrorHandler for ErrorMessageHandler {
    async fn on_error(&self, container: Arc<MessageContainer>, error: anyhow::Error) {
        tracing::warn!(
            message = container.message().id(),
            endpoint = self.flow.endpoint_name(),
            attempts = container.message().delivery_count(),
            error = %error,
            "message processing failed"
        );
        match &self.error_queue {
            Some(error_queue) => {
                if let Err(err) = error_queue
                    .republish_or_requeue(Arc::clone(&self.flow), Arc::clone(&container))
                    .await
                {
                    tracing::error!(
                        message = container.message().id(),
                        error = %err,
                        "error queue handling failed, requeueing"
                    );
                    if let Err(err) = self.flow.requeue(&container).await {
                        tracing::error!(
                            message = container.message().id(),
                            error = %err,
                            "failed to requeue message"
                        );
                    }
                }
            }
            None => {
                if let Err(err) = self.flow.requeue(&container).await {
                    tracing::error!(
                        message = container.message().id(),
                        error = %err,
                        "failed to requeue message"
                    );
                }
            }
        }
    }
}
