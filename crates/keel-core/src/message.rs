//! Domain messages emitted by aggregates.
//!
//! A [`MessageDraft`] is what domain code produces; the lifecycle assistant
//! turns it into a [`Message`] by stamping the aggregate identity, version,
//! sequence number and phase. Once stamped, a message is never changed.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::AggregateId;
use crate::error::DomainError;
use crate::lifecycle::LifecyclePhase;

/// Message type of the lifecycle message emitted by `enable`.
pub const LIFECYCLE_ENABLED_MESSAGE_TYPE: &str = "lifecycle.enabled";

/// Message type of the lifecycle message emitted by `destroy`.
pub const LIFECYCLE_DESTROYED_MESSAGE_TYPE: &str = "lifecycle.destroyed";

/// Immutable record of a state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub message_id: Uuid,
    /// Type name used for routing and saga matching.
    pub message_type: String,
    /// Type of the emitting aggregate.
    pub aggregate_type: String,
    /// Identity of the emitting aggregate.
    pub aggregate_id: AggregateId,
    /// Aggregate version at emission time.
    pub aggregate_version: i64,
    /// Per-aggregate sequence number, starting at 1.
    pub sequence_number: i64,
    /// Aggregate lifecycle phase at emission time.
    pub phase: LifecyclePhase,
    /// Publish synchronously before the post-commit callback returns.
    pub effect_immediately: bool,
    /// Saga queue this message is routed to, if any.
    pub queue: Option<String>,
    /// Saga tracking token correlating this message to a process.
    pub tracking_token: Option<String>,
    /// Correlation ID for tracing a command through its effects.
    pub correlation_id: Option<Uuid>,
    /// Domain payload.
    pub payload: serde_json::Value,
    /// Emission timestamp.
    pub occurred_at: DateTime<Utc>,
}

impl Message {
    /// The key that publication order is preserved under.
    #[must_use]
    pub fn ordering_key(&self) -> &AggregateId {
        &self.aggregate_id
    }

    /// Returns `true` for messages emitted by `enable`/`destroy`.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        self.message_type == LIFECYCLE_ENABLED_MESSAGE_TYPE
            || self.message_type == LIFECYCLE_DESTROYED_MESSAGE_TYPE
    }

    /// Deserializes the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Where a message comes from: the stamp applied when a draft is recorded.
#[derive(Debug, Clone)]
pub struct MessageOrigin {
    /// Type of the emitting aggregate (or saga).
    pub aggregate_type: String,
    /// Identity of the emitter.
    pub aggregate_id: AggregateId,
    /// Version of the emitter at emission time.
    pub aggregate_version: i64,
    /// Sequence number assigned to the message.
    pub sequence_number: i64,
    /// Phase of the emitter at emission time.
    pub phase: LifecyclePhase,
}

/// A message as produced by domain code, before it is stamped.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    message_type: String,
    payload: serde_json::Value,
    effect_immediately: bool,
    queue: Option<String>,
    tracking_token: Option<String>,
    correlation_id: Option<Uuid>,
}

impl MessageDraft {
    /// Creates a draft from a serializable payload.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the payload cannot be
    /// serialized.
    pub fn new(message_type: impl Into<String>, payload: &impl Serialize) -> Result<Self, DomainError> {
        Ok(Self::from_value(message_type, serde_json::to_value(payload)?))
    }

    /// Creates a draft from an already serialized payload.
    #[must_use]
    pub fn from_value(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            effect_immediately: false,
            queue: None,
            tracking_token: None,
            correlation_id: None,
        }
    }

    /// Marks the message for synchronous publication at post-commit.
    #[must_use]
    pub fn effect_immediately(mut self) -> Self {
        self.effect_immediately = true;
        self
    }

    /// Routes the message to a saga queue without a tracking token; a saga
    /// started by it is assigned a fresh token.
    #[must_use]
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Routes the message to the saga identified by `(queue, token)`.
    #[must_use]
    pub fn routed_to(mut self, queue: impl Into<String>, token: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self.tracking_token = Some(token.into());
        self
    }

    /// Attaches a correlation ID.
    #[must_use]
    pub fn correlated(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// The draft's message type.
    #[must_use]
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// The saga queue the draft is routed to, if any.
    #[must_use]
    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    /// Stamps the draft, producing an immutable message.
    #[must_use]
    pub fn into_message(self, origin: MessageOrigin, occurred_at: DateTime<Utc>) -> Message {
        Message {
            message_id: Uuid::now_v7(),
            message_type: self.message_type,
            aggregate_type: origin.aggregate_type,
            aggregate_id: origin.aggregate_id,
            aggregate_version: origin.aggregate_version,
            sequence_number: origin.sequence_number,
            phase: origin.phase,
            effect_immediately: self.effect_immediately,
            queue: self.queue,
            tracking_token: self.tracking_token,
            correlation_id: self.correlation_id,
            payload: self.payload,
            occurred_at,
        }
    }
}
