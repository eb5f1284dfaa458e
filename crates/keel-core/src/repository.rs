//! Aggregate storage abstraction and the typed repository.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::aggregate::{Aggregate, AggregateHandle, AggregateId, AggregateState, ConcurrencyPolicy};
use crate::error::DomainError;
use crate::lifecycle::LifecyclePhase;
use crate::manager::{Context, UnitOfWorkManager};
use crate::message::Message;
use crate::transaction::TransactionId;

/// Stored representation of an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAggregate {
    /// Aggregate type discriminator.
    pub aggregate_type: String,
    /// Aggregate identity.
    pub aggregate_id: AggregateId,
    /// Version (`vn`).
    pub version: i64,
    /// Number of messages ever flushed (`mn`).
    pub sequence: i64,
    /// Lifecycle phase.
    pub phase: LifecyclePhase,
    /// Serialized domain state.
    pub state: serde_json::Value,
}

/// Persistence store for aggregate state and extracted messages.
///
/// Every write is staged under a transaction and becomes visible only when
/// the store (as a `TransactionalResource`) commits that transaction.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Loads the committed record of an aggregate.
    async fn load(
        &self,
        transaction: TransactionId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Option<StoredAggregate>, DomainError>;

    /// Locks the aggregate's row until `transaction` completes. Locking a row
    /// already held by the same transaction is a no-op.
    async fn lock(
        &self,
        transaction: TransactionId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<(), DomainError>;

    /// Writes `record`. With `expected_version` the write fails with
    /// `DomainError::ConcurrentModification` unless the stored version
    /// matches; `None` expects no stored row.
    async fn save(
        &self,
        transaction: TransactionId,
        record: &StoredAggregate,
        expected_version: Option<i64>,
    ) -> Result<(), DomainError>;

    /// Appends extracted messages.
    async fn append_messages(
        &self,
        transaction: TransactionId,
        messages: &[Message],
    ) -> Result<(), DomainError>;

    /// Loads all committed messages of an aggregate, ordered by sequence.
    async fn load_messages(
        &self,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<Message>, DomainError>;
}

/// Typed access to aggregates of one type within the current unit of work.
pub struct Repository<S> {
    manager: Arc<UnitOfWorkManager>,
    _state: PhantomData<fn() -> S>,
}

impl<S> Clone for Repository<S> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            _state: PhantomData,
        }
    }
}

impl<S: AggregateState> Repository<S> {
    /// Creates a repository resolving units of work through `manager`.
    #[must_use]
    pub fn new(manager: Arc<UnitOfWorkManager>) -> Self {
        Self {
            manager,
            _state: PhantomData,
        }
    }

    /// Loads an aggregate and tracks it in the context's unit of work.
    ///
    /// Loading the same aggregate twice within one unit of work returns the
    /// same handle. For pessimistic aggregate types the row is locked before
    /// it is read.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NoActiveTransaction` outside a transaction,
    /// `DomainError::AggregateNotFound` if nothing is stored under `id`, or
    /// a store error.
    pub async fn load(
        &self,
        ctx: &Context,
        id: &AggregateId,
    ) -> Result<AggregateHandle<S>, DomainError> {
        let unit_of_work = self.manager.current(ctx)?;
        if let Some(handle) = unit_of_work.find::<S>(id) {
            return Ok(handle);
        }
        let store = unit_of_work.store();
        let transaction = unit_of_work.transaction();
        if S::CONCURRENCY == ConcurrencyPolicy::Pessimistic {
            store.lock(transaction, S::AGGREGATE_TYPE, id).await?;
        }
        let record = store
            .load(transaction, S::AGGREGATE_TYPE, id)
            .await?
            .ok_or_else(|| DomainError::AggregateNotFound(id.clone()))?;
        let handle = AggregateHandle::new(Aggregate::hydrate(&record)?);
        unit_of_work.track(handle.clone()).await?;
        Ok(handle)
    }

    /// Tracks a new aggregate in the context's unit of work.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NoActiveTransaction` outside a transaction, or
    /// a store error when taking a pessimistic lock.
    pub async fn add(
        &self,
        ctx: &Context,
        aggregate: Aggregate<S>,
    ) -> Result<AggregateHandle<S>, DomainError> {
        let unit_of_work = self.manager.current(ctx)?;
        let handle = AggregateHandle::new(aggregate);
        unit_of_work.track(handle.clone()).await?;
        Ok(handle)
    }

    /// Loads the committed message history of an aggregate.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn history(&self, id: &AggregateId) -> Result<Vec<Message>, DomainError> {
        self.manager
            .store()
            .load_messages(S::AGGREGATE_TYPE, id)
            .await
    }
}
