//! The transaction-scoped unit of work.
//!
//! A [`UnitOfWork`] collects the aggregates touched within one transaction.
//! At pre-commit it drains their pending messages and writes state plus
//! messages through the store; at post-commit it publishes what it drained,
//! or discards it on rollback. It never rolls back in-memory aggregate state.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use uuid::Uuid;

use crate::aggregate::{AggregateHandle, AggregateId, AggregateState, ConcurrencyPolicy};
use crate::dispatch::MessageDispatcher;
use crate::error::DomainError;
use crate::manager::BindingTable;
use crate::message::Message;
use crate::repository::{AggregateStore, StoredAggregate};
use crate::transaction::{Outcome, Participant, TransactionId};

/// Completion state of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkState {
    /// Accepting aggregates.
    Active,
    /// Flushing at pre-commit.
    PreCommitting,
    /// The transaction committed.
    Committed,
    /// The transaction rolled back.
    RolledBack,
}

/// What pre-commit writes for one aggregate.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    /// Aggregate state after extraction.
    pub record: StoredAggregate,
    /// Version the aggregate was loaded at, `None` if new.
    pub expected_version: Option<i64>,
    /// Messages drained from the aggregate, in sequence order.
    pub messages: Vec<Message>,
}

impl FlushBatch {
    /// Returns `false` for an aggregate that was only read.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.expected_version != Some(self.record.version) || !self.messages.is_empty()
    }
}

/// Type-erased view of a tracked aggregate handle.
pub trait Trackable: Send + Sync {
    /// Identity of the in-memory instance.
    fn instance(&self) -> Uuid;

    /// Aggregate type name.
    fn aggregate_type(&self) -> &'static str;

    /// Concurrency policy of the aggregate type.
    fn concurrency(&self) -> ConcurrencyPolicy;

    /// Aggregate identity, if assigned.
    fn aggregate_id(&self) -> Option<AggregateId>;

    /// Assigns identity if needed, drains messages with `flush = true` and
    /// snapshots the state.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ExtractionRace` if the aggregate is held
    /// elsewhere, or a serialization error.
    fn prepare_flush(&self) -> Result<FlushBatch, DomainError>;

    /// Records that `version` is now the stored version.
    fn confirm_persisted(&self, version: i64);

    /// Upcast for typed lookups.
    fn as_any(&self) -> &dyn Any;
}

impl<S: AggregateState> Trackable for AggregateHandle<S> {
    fn instance(&self) -> Uuid {
        AggregateHandle::instance(self)
    }

    fn aggregate_type(&self) -> &'static str {
        S::AGGREGATE_TYPE
    }

    fn concurrency(&self) -> ConcurrencyPolicy {
        S::CONCURRENCY
    }

    fn aggregate_id(&self) -> Option<AggregateId> {
        AggregateHandle::aggregate_id(self).cloned()
    }

    fn prepare_flush(&self) -> Result<FlushBatch, DomainError> {
        let mut aggregate = self.lock_for_extraction()?;
        if aggregate.id().is_unassigned() {
            aggregate.assign_identity(AggregateId::generate());
        }
        self.record_identity(aggregate.id());
        let expected_version = aggregate.persisted_version();
        let state = serde_json::to_value(aggregate.state())?;
        let messages = aggregate.extract_messages(true);
        let record = StoredAggregate {
            aggregate_type: S::AGGREGATE_TYPE.to_owned(),
            aggregate_id: aggregate.id().clone(),
            version: aggregate.version(),
            sequence: aggregate.sequence(),
            phase: aggregate.phase(),
            state,
        };
        Ok(FlushBatch {
            record,
            expected_version,
            messages,
        })
    }

    fn confirm_persisted(&self, version: i64) {
        self.lock().mark_persisted(version);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Collects the aggregates touched within one transaction.
pub struct UnitOfWork {
    transaction: TransactionId,
    store: Arc<dyn AggregateStore>,
    dispatcher: Arc<MessageDispatcher>,
    bindings: Weak<BindingTable>,
    state: Mutex<UnitOfWorkState>,
    tracked: Mutex<Vec<Arc<dyn Trackable>>>,
    flushed: Mutex<Vec<(Arc<dyn Trackable>, i64)>>,
    extracted: Mutex<Vec<Message>>,
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("transaction", &self.transaction)
            .field("state", &self.state())
            .field("tracked", &self.tracked_count())
            .finish_non_exhaustive()
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UnitOfWork {
    pub(crate) fn new(
        transaction: TransactionId,
        store: Arc<dyn AggregateStore>,
        dispatcher: Arc<MessageDispatcher>,
        bindings: Weak<BindingTable>,
    ) -> Self {
        Self {
            transaction,
            store,
            dispatcher,
            bindings,
            state: Mutex::new(UnitOfWorkState::Active),
            tracked: Mutex::new(Vec::new()),
            flushed: Mutex::new(Vec::new()),
            extracted: Mutex::new(Vec::new()),
        }
    }

    /// The transaction this unit of work is bound to.
    #[must_use]
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// The store aggregates are written through.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.store
    }

    /// Current completion state.
    #[must_use]
    pub fn state(&self) -> UnitOfWorkState {
        *guard(&self.state)
    }

    /// Number of tracked aggregates.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        guard(&self.tracked).len()
    }

    /// Messages drained at pre-commit, in flush order. Empty after a
    /// rollback.
    #[must_use]
    pub fn extracted_messages(&self) -> Vec<Message> {
        guard(&self.extracted).clone()
    }

    /// Registers a touched aggregate. Tracking the same instance again is a
    /// no-op. Pessimistic aggregate types with an identity are locked here.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::TransactionNotActive` once pre-commit started,
    /// or the store's locking error.
    pub async fn track<T: Trackable + 'static>(&self, aggregate: T) -> Result<(), DomainError> {
        if self.state() != UnitOfWorkState::Active {
            return Err(DomainError::TransactionNotActive(self.transaction));
        }
        let instance = aggregate.instance();
        if self.is_tracked(instance) {
            return Ok(());
        }
        if aggregate.concurrency() == ConcurrencyPolicy::Pessimistic {
            if let Some(id) = aggregate.aggregate_id() {
                self.store
                    .lock(self.transaction, aggregate.aggregate_type(), &id)
                    .await?;
            }
        }
        let mut tracked = guard(&self.tracked);
        if !tracked.iter().any(|t| t.instance() == instance) {
            tracing::debug!(
                transaction = %self.transaction,
                aggregate_type = aggregate.aggregate_type(),
                aggregate_id = ?aggregate.aggregate_id(),
                "aggregate tracked"
            );
            tracked.push(Arc::new(aggregate));
        }
        Ok(())
    }

    fn is_tracked(&self, instance: Uuid) -> bool {
        guard(&self.tracked).iter().any(|t| t.instance() == instance)
    }

    /// Returns the tracked handle of the aggregate `id`, if any.
    #[must_use]
    pub fn find<S: AggregateState>(&self, id: &AggregateId) -> Option<AggregateHandle<S>> {
        guard(&self.tracked)
            .iter()
            .filter(|t| t.aggregate_type() == S::AGGREGATE_TYPE)
            .filter(|t| t.aggregate_id().as_ref() == Some(id))
            .find_map(|t| t.as_any().downcast_ref::<AggregateHandle<S>>().cloned())
    }

    fn transition(&self, from: UnitOfWorkState, to: UnitOfWorkState) -> Result<(), DomainError> {
        let mut state = guard(&self.state);
        if *state != from {
            return Err(DomainError::TransactionNotActive(self.transaction));
        }
        *state = to;
        Ok(())
    }

    async fn flush(&self) -> Result<(), DomainError> {
        let tracked = guard(&self.tracked).clone();
        let mut flushed = Vec::with_capacity(tracked.len());
        let mut extracted = Vec::new();
        for aggregate in &tracked {
            let batch = aggregate.prepare_flush()?;
            if !batch.is_dirty() {
                continue;
            }
            self.store
                .save(self.transaction, &batch.record, batch.expected_version)
                .await?;
            self.store
                .append_messages(self.transaction, &batch.messages)
                .await?;
            tracing::debug!(
                transaction = %self.transaction,
                aggregate_type = %batch.record.aggregate_type,
                aggregate_id = %batch.record.aggregate_id,
                version = batch.record.version,
                sequence = batch.record.sequence,
                messages = batch.messages.len(),
                "aggregate flushed"
            );
            flushed.push((Arc::clone(aggregate), batch.record.version));
            extracted.extend(batch.messages);
        }
        tracing::info!(
            transaction = %self.transaction,
            aggregates = flushed.len(),
            messages = extracted.len(),
            "unit of work flushed"
        );
        *guard(&self.flushed) = flushed;
        *guard(&self.extracted) = extracted;
        Ok(())
    }

    /// Hands committed messages to the dispatcher. On a dispatcher worker,
    /// immediate messages cannot wait for a queue, so every message of an
    /// aggregate with an immediate message is published inline, in order.
    async fn publish(&self, messages: Vec<Message>) {
        let inline: HashSet<AggregateId> = if self.dispatcher.on_worker() {
            messages
                .iter()
                .filter(|message| message.effect_immediately)
                .map(|message| message.ordering_key().clone())
                .collect()
        } else {
            HashSet::new()
        };
        for message in messages {
            let message_id = message.message_id;
            let result = if inline.contains(message.ordering_key()) {
                self.dispatcher.publish_inline(&message).await
            } else if message.effect_immediately {
                self.dispatcher.dispatch_and_wait(message).await
            } else {
                self.dispatcher.dispatch(message)
            };
            if let Err(err) = result {
                tracing::error!(
                    transaction = %self.transaction,
                    %message_id,
                    error = %err,
                    "post-commit publication failed"
                );
            }
        }
    }

    fn unbind(&self) {
        if let Some(bindings) = self.bindings.upgrade() {
            guard(&bindings).remove(&self.transaction);
        }
    }
}

#[async_trait]
impl Participant for UnitOfWork {
    async fn before_commit(&self) -> Result<(), DomainError> {
        self.transition(UnitOfWorkState::Active, UnitOfWorkState::PreCommitting)?;
        self.flush().await
    }

    async fn after_completion(&self, outcome: Outcome) {
        let final_state = match outcome {
            Outcome::Committed => UnitOfWorkState::Committed,
            Outcome::RolledBack => UnitOfWorkState::RolledBack,
        };
        *guard(&self.state) = final_state;

        let flushed = std::mem::take(&mut *guard(&self.flushed));
        match outcome {
            Outcome::Committed => {
                for (aggregate, version) in &flushed {
                    aggregate.confirm_persisted(*version);
                }
                let extracted = guard(&self.extracted).clone();
                self.publish(extracted).await;
            }
            Outcome::RolledBack => {
                let discarded = std::mem::take(&mut *guard(&self.extracted));
                tracing::debug!(
                    transaction = %self.transaction,
                    discarded = discarded.len(),
                    "unit of work rolled back, messages discarded"
                );
            }
        }
        guard(&self.tracked).clear();
        self.unbind();
    }
}
