//! Transport used by the demo binary.

use async_trait::async_trait;
use keel_core::aggregate::AggregateId;
use keel_core::dispatch::Publisher;
use keel_core::error::DomainError;
use keel_core::message::Message;

/// Publishes messages by logging them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

#[async_trait]
impl Publisher for TracingPublisher {
    async fn publish(&self, message: &Message, ordering_key: &AggregateId) -> Result<(), DomainError> {
        tracing::info!(
            message_id = %message.message_id,
            message_type = %message.message_type,
            aggregate_type = %message.aggregate_type,
            %ordering_key,
            sequence_number = message.sequence_number,
            queue = message.queue.as_deref(),
            tracking_token = message.tracking_token.as_deref(),
            "message published"
        );
        Ok(())
    }
}
