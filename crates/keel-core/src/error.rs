//! Domain error types.

use thiserror::Error;

use crate::aggregate::AggregateId;
use crate::transaction::TransactionId;

/// Top-level domain error type.
#[derive(Debug, Clone, Error)]
pub enum DomainError {
    /// A unit of work was requested outside any active transaction.
    #[error("no active transaction bound to the calling context")]
    NoActiveTransaction,

    /// The stored version of an aggregate differs from the version it was
    /// loaded at.
    #[error(
        "concurrent modification of {aggregate_type} {aggregate_id}: expected version {expected:?}, found {actual:?}"
    )]
    ConcurrentModification {
        /// The aggregate type.
        aggregate_type: String,
        /// The aggregate that had the conflict.
        aggregate_id: AggregateId,
        /// The version the aggregate was loaded at (`None` for a new aggregate).
        expected: Option<i64>,
        /// The version found in the store (`None` when the row is held by
        /// another in-flight transaction or absent).
        actual: Option<i64>,
    },

    /// An aggregate instance was still held elsewhere when its messages were
    /// extracted.
    #[error("concurrent message extraction on a {aggregate_type} instance")]
    ExtractionRace {
        /// The aggregate type of the contended instance.
        aggregate_type: String,
    },

    /// A committed message could not be handed to the transport.
    #[error("publication of message {message_id} failed: {reason}")]
    PublicationFailure {
        /// The message that failed to publish.
        message_id: uuid::Uuid,
        /// Transport-provided reason.
        reason: String,
    },

    /// A saga step handler failed.
    #[error("saga {saga_id} step {step} failed: {reason}")]
    SagaStepFailure {
        /// The saga the step belongs to.
        saga_id: uuid::Uuid,
        /// The step counter at the time of failure.
        step: i64,
        /// Handler-provided reason.
        reason: String,
    },

    /// An aggregate was not found.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(AggregateId),

    /// A business operation was invoked on a destroyed aggregate.
    #[error("aggregate {0} is destroyed")]
    AggregateDestroyed(AggregateId),

    /// The transaction is unknown or already completing.
    #[error("transaction {0} is not active")]
    TransactionNotActive(TransactionId),

    /// The transaction deadline elapsed before commit finished.
    #[error("transaction {0} timed out")]
    TransactionTimedOut(TransactionId),

    /// A validation error in domain logic.
    #[error("validation error: {0}")]
    Validation(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::Infrastructure(format!("serialization failed: {err}"))
    }
}
