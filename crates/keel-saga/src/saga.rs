//! The saga record.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keel_core::aggregate::AggregateId;
use keel_core::message::Message;

/// Correlation key of a saga: the queue it listens on and its tracking
/// token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SagaKey {
    /// Queue (saga category).
    pub queue: String,
    /// Tracking token correlating the messages of one process.
    pub token: String,
}

impl SagaKey {
    /// Creates a key.
    #[must_use]
    pub fn new(queue: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            token: token.into(),
        }
    }
}

impl fmt::Display for SagaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.queue, self.token)
    }
}

/// Highest sequence number seen from one aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterMark {
    /// Emitting aggregate type.
    pub aggregate_type: String,
    /// Emitting aggregate.
    pub aggregate_id: AggregateId,
    /// Highest sequence number handled.
    pub sequence_number: i64,
}

/// A failed step, kept on the saga for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    /// Step counter value of the failed step.
    pub step: i64,
    /// The message the step was handling.
    pub message_id: Uuid,
    /// Handler-provided reason.
    pub reason: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

/// A long-running process correlated across messages by `(queue, token)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Saga {
    id: Uuid,
    definition: String,
    key: SagaKey,
    state: serde_json::Value,
    step: i64,
    completed: bool,
    aggregates: BTreeSet<AggregateId>,
    high_water: Vec<HighWaterMark>,
    failures: Vec<StepFailure>,
    emitted: i64,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Saga {
    /// Starts a saga for `definition` under `key`.
    #[must_use]
    pub fn begin(definition: impl Into<String>, key: SagaKey, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition: definition.into(),
            key,
            state: serde_json::Value::Null,
            step: 0,
            completed: false,
            aggregates: BTreeSet::new(),
            high_water: Vec::new(),
            failures: Vec::new(),
            emitted: 0,
            started_at: now,
            updated_at: now,
        }
    }

    /// Unique saga identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the definition driving this saga.
    #[must_use]
    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Correlation key.
    #[must_use]
    pub fn key(&self) -> &SagaKey {
        &self.key
    }

    /// Accumulated process state.
    #[must_use]
    pub fn state(&self) -> &serde_json::Value {
        &self.state
    }

    /// Number of steps applied so far.
    #[must_use]
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Returns `true` once the process has finished.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Aggregates whose messages this saga has handled.
    #[must_use]
    pub fn aggregates(&self) -> &BTreeSet<AggregateId> {
        &self.aggregates
    }

    /// Recorded step failures, oldest first.
    #[must_use]
    pub fn failures(&self) -> &[StepFailure] {
        &self.failures
    }

    /// Number of messages this saga has emitted.
    #[must_use]
    pub fn emitted(&self) -> i64 {
        self.emitted
    }

    /// When the saga began.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// When the saga last advanced.
    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns `true` if `message` is at or below the high-water mark of its
    /// aggregate, i.e. a redelivery.
    #[must_use]
    pub fn has_seen(&self, message: &Message) -> bool {
        self.mark_for(message)
            .is_some_and(|mark| message.sequence_number <= mark.sequence_number)
    }

    fn mark_for(&self, message: &Message) -> Option<&HighWaterMark> {
        self.high_water.iter().find(|mark| {
            mark.aggregate_type == message.aggregate_type
                && mark.aggregate_id == message.aggregate_id
        })
    }

    /// Raises the high-water mark of the message's aggregate and records the
    /// aggregate as referenced.
    pub(crate) fn observe(&mut self, message: &Message) {
        self.aggregates.insert(message.aggregate_id.clone());
        match self.high_water.iter_mut().find(|mark| {
            mark.aggregate_type == message.aggregate_type
                && mark.aggregate_id == message.aggregate_id
        }) {
            Some(mark) => mark.sequence_number = mark.sequence_number.max(message.sequence_number),
            None => self.high_water.push(HighWaterMark {
                aggregate_type: message.aggregate_type.clone(),
                aggregate_id: message.aggregate_id.clone(),
                sequence_number: message.sequence_number,
            }),
        }
    }

    pub(crate) fn set_state(&mut self, state: serde_json::Value) {
        self.state = state;
    }

    pub(crate) fn complete(&mut self) {
        self.completed = true;
    }

    pub(crate) fn finish_step(&mut self, now: DateTime<Utc>) -> i64 {
        self.step += 1;
        self.updated_at = now;
        self.step
    }

    pub(crate) fn record_failure(&mut self, failure: StepFailure) {
        self.failures.push(failure);
    }

    /// Reserves the next sequence number for a message emitted by this saga.
    pub(crate) fn next_emission(&mut self) -> i64 {
        self.emitted += 1;
        self.emitted
    }
}
