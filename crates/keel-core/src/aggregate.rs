//! Aggregate root abstraction.
//!
//! An [`Aggregate`] wraps domain state `S` with identity, version (`vn`),
//! lifecycle phase and the pending-message buffer kept by its
//! [`LifecycleAssistant`]. Application code mutates it through an
//! [`AggregateHandle`], which is what a unit of work tracks.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, TryLockError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DomainError;
use crate::lifecycle::{LifecycleAssistant, LifecyclePhase};
use crate::message::{
    LIFECYCLE_DESTROYED_MESSAGE_TYPE, LIFECYCLE_ENABLED_MESSAGE_TYPE, Message, MessageDraft,
};
use crate::repository::StoredAggregate;

/// Opaque aggregate key. Empty until assigned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(String);

impl AggregateId {
    /// Generates a fresh, time-ordered identity.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns `true` if no identity has been assigned yet.
    #[must_use]
    pub fn is_unassigned(&self) -> bool {
        self.0.is_empty()
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unassigned() {
            f.write_str("<unassigned>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for AggregateId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for AggregateId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// How concurrent writers of one aggregate type are kept apart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Compare the loaded `vn` with the stored one at pre-commit.
    #[default]
    Optimistic,
    /// Lock the stored row at first touch and hold it until completion.
    Pessimistic,
}

/// Domain state carried by an aggregate.
pub trait AggregateState: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable aggregate type name, used as the storage discriminator.
    const AGGREGATE_TYPE: &'static str;

    /// Concurrency policy for every aggregate of this type.
    const CONCURRENCY: ConcurrencyPolicy = ConcurrencyPolicy::Optimistic;
}

/// A consistency boundary with identity, version and a message buffer.
#[derive(Debug)]
pub struct Aggregate<S> {
    id: AggregateId,
    version: i64,
    persisted_version: Option<i64>,
    lifecycle: LifecycleAssistant,
    state: S,
}

impl<S: AggregateState> Default for Aggregate<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: AggregateState> Aggregate<S> {
    /// Creates a new aggregate without identity; one is assigned when it is
    /// first persisted.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(AggregateId::default())
    }

    /// Creates a new aggregate with an application-supplied identity.
    #[must_use]
    pub fn with_id(id: AggregateId) -> Self {
        Self {
            id,
            version: 0,
            persisted_version: None,
            lifecycle: LifecycleAssistant::default(),
            state: S::default(),
        }
    }

    /// Reconstructs an aggregate from its stored record.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the record belongs to another
    /// aggregate type, or `DomainError::Infrastructure` if the state does not
    /// deserialize.
    pub fn hydrate(record: &StoredAggregate) -> Result<Self, DomainError> {
        if record.aggregate_type != S::AGGREGATE_TYPE {
            return Err(DomainError::Validation(format!(
                "record of type {} cannot hydrate a {}",
                record.aggregate_type,
                S::AGGREGATE_TYPE
            )));
        }
        let state: S = serde_json::from_value(record.state.clone())?;
        Ok(Self {
            id: record.aggregate_id.clone(),
            version: record.version,
            persisted_version: Some(record.version),
            lifecycle: LifecycleAssistant::restore(record.phase, record.sequence),
            state,
        })
    }

    /// Aggregate identity; unassigned before the first persist.
    #[must_use]
    pub fn id(&self) -> &AggregateId {
        &self.id
    }

    /// Current version (`vn`).
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Version last confirmed in storage, `None` if never persisted.
    #[must_use]
    pub fn persisted_version(&self) -> Option<i64> {
        self.persisted_version
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> LifecyclePhase {
        self.lifecycle.phase()
    }

    /// Number of messages ever flushed (`mn`).
    #[must_use]
    pub fn sequence(&self) -> i64 {
        self.lifecycle.sequence()
    }

    /// Domain state.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Messages emitted but not yet flushed.
    #[must_use]
    pub fn pending_messages(&self) -> &[Message] {
        self.lifecycle.pending()
    }

    /// Applies a domain operation.
    ///
    /// On success `vn` is incremented once and every returned draft is
    /// recorded, tagged with the new `vn` and the current phase. An operation
    /// returning no drafts reports that nothing changed and leaves `vn` as
    /// is. If the operation fails nothing is recorded and `vn` is unchanged;
    /// any partial change it made to the state is its own responsibility.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateDestroyed` if the aggregate is
    /// destroyed, or whatever error the operation returns.
    pub fn mutate<F>(&mut self, clock: &dyn Clock, operation: F) -> Result<(), DomainError>
    where
        F: FnOnce(&mut S) -> Result<Vec<MessageDraft>, DomainError>,
    {
        if self.phase() == LifecyclePhase::Destroyed {
            return Err(DomainError::AggregateDestroyed(self.id.clone()));
        }
        let drafts = operation(&mut self.state)?;
        if drafts.is_empty() {
            return Ok(());
        }
        self.version += 1;
        for draft in drafts {
            self.lifecycle
                .record(draft, S::AGGREGATE_TYPE, &self.id, self.version, clock);
        }
        Ok(())
    }

    /// Moves the aggregate to `Enabled`, emitting a lifecycle message with
    /// `param` as payload. Also re-enables a destroyed aggregate. Returns
    /// `false` without emitting anything if already enabled.
    pub fn enable(&mut self, param: serde_json::Value, clock: &dyn Clock) -> bool {
        self.transition(LifecyclePhase::Enabled, LIFECYCLE_ENABLED_MESSAGE_TYPE, param, clock)
    }

    /// Moves the aggregate to `Destroyed`, emitting a lifecycle message with
    /// `param` as payload. Returns `false` without emitting anything if
    /// already destroyed.
    pub fn destroy(&mut self, param: serde_json::Value, clock: &dyn Clock) -> bool {
        self.transition(
            LifecyclePhase::Destroyed,
            LIFECYCLE_DESTROYED_MESSAGE_TYPE,
            param,
            clock,
        )
    }

    fn transition(
        &mut self,
        next: LifecyclePhase,
        message_type: &str,
        param: serde_json::Value,
        clock: &dyn Clock,
    ) -> bool {
        if !self.lifecycle.advance(next) {
            return false;
        }
        self.version += 1;
        self.lifecycle.record(
            MessageDraft::from_value(message_type, param),
            S::AGGREGATE_TYPE,
            &self.id,
            self.version,
            clock,
        );
        true
    }

    /// Returns the pending messages in emission order. With `flush`, they
    /// are removed from the buffer and `mn` advances by their count in the
    /// same step.
    pub fn extract_messages(&mut self, flush: bool) -> Vec<Message> {
        self.lifecycle.extract(&self.id, flush)
    }

    /// Snapshot of the persistable part of the aggregate.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the state does not serialize.
    pub fn to_record(&self) -> Result<StoredAggregate, DomainError> {
        Ok(StoredAggregate {
            aggregate_type: S::AGGREGATE_TYPE.to_owned(),
            aggregate_id: self.id.clone(),
            version: self.version,
            sequence: self.sequence(),
            phase: self.phase(),
            state: serde_json::to_value(&self.state)?,
        })
    }

    pub(crate) fn assign_identity(&mut self, id: AggregateId) {
        if self.id.is_unassigned() {
            tracing::debug!(aggregate_type = S::AGGREGATE_TYPE, aggregate_id = %id, "identity assigned");
            self.id = id;
        }
    }

    pub(crate) fn mark_persisted(&mut self, version: i64) {
        self.persisted_version = Some(version);
    }
}

/// Shared, lockable reference to an aggregate.
///
/// Cloning a handle yields another reference to the same instance. Guards
/// returned by [`lock`](Self::lock) must not be held across an `.await`.
#[derive(Debug)]
pub struct AggregateHandle<S> {
    instance: Uuid,
    key: Arc<OnceLock<AggregateId>>,
    inner: Arc<Mutex<Aggregate<S>>>,
}

impl<S> Clone for AggregateHandle<S> {
    fn clone(&self) -> Self {
        Self {
            instance: self.instance,
            key: Arc::clone(&self.key),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: AggregateState> AggregateHandle<S> {
    /// Wraps an aggregate in a new handle.
    #[must_use]
    pub fn new(aggregate: Aggregate<S>) -> Self {
        let key = OnceLock::new();
        if !aggregate.id().is_unassigned() {
            let _ = key.set(aggregate.id().clone());
        }
        Self {
            instance: Uuid::new_v4(),
            key: Arc::new(key),
            inner: Arc::new(Mutex::new(aggregate)),
        }
    }

    /// Identity of the in-memory instance (not of the aggregate).
    #[must_use]
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Aggregate identity, readable without locking; `None` until assigned.
    #[must_use]
    pub fn aggregate_id(&self) -> Option<&AggregateId> {
        self.key.get()
    }

    /// Locks the aggregate for reading or mutation.
    pub fn lock(&self) -> MutexGuard<'_, Aggregate<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the aggregate for message extraction, failing instead of
    /// waiting if another context holds it.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ExtractionRace` if the aggregate is held.
    pub fn lock_for_extraction(&self) -> Result<MutexGuard<'_, Aggregate<S>>, DomainError> {
        match self.inner.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(DomainError::ExtractionRace {
                aggregate_type: S::AGGREGATE_TYPE.to_owned(),
            }),
        }
    }

    pub(crate) fn record_identity(&self, id: &AggregateId) {
        let _ = self.key.set(id.clone());
    }
}
