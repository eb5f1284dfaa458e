//! Test stores: a mock `AggregateStore` that fails on write.

use std::sync::Mutex;

use async_trait::async_trait;
use keel_core::aggregate::AggregateId;
use keel_core::error::DomainError;
use keel_core::message::Message;
use keel_core::repository::{AggregateStore, StoredAggregate};
use keel_core::transaction::{TransactionId, TransactionalResource};

/// An aggregate store that holds nothing and fails every `save` with the
/// configured message. Records the transactions it was asked to roll back.
#[derive(Debug)]
pub struct FailingAggregateStore {
    error_message: String,
    rolled_back: Mutex<Vec<TransactionId>>,
    committed: Mutex<Vec<TransactionId>>,
}

impl FailingAggregateStore {
    /// Create a new failing store that returns `error_message` as a
    /// `DomainError::Infrastructure` on every write.
    #[must_use]
    pub fn new(error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            rolled_back: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
        }
    }

    /// Transactions rolled back so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn rolled_back(&self) -> Vec<TransactionId> {
        self.rolled_back.lock().unwrap().clone()
    }

    /// Transactions committed so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn committed(&self) -> Vec<TransactionId> {
        self.committed.lock().unwrap().clone()
    }
}

#[async_trait]
impl AggregateStore for FailingAggregateStore {
    async fn load(
        &self,
        _transaction: TransactionId,
        _aggregate_type: &str,
        _aggregate_id: &AggregateId,
    ) -> Result<Option<StoredAggregate>, DomainError> {
        Ok(None)
    }

    async fn lock(
        &self,
        _transaction: TransactionId,
        _aggregate_type: &str,
        _aggregate_id: &AggregateId,
    ) -> Result<(), DomainError> {
        Ok(())
    }

    async fn save(
        &self,
        _transaction: TransactionId,
        _record: &StoredAggregate,
        _expected_version: Option<i64>,
    ) -> Result<(), DomainError> {
        Err(DomainError::Infrastructure(self.error_message.clone()))
    }

    async fn append_messages(
        &self,
        _transaction: TransactionId,
        _messages: &[Message],
    ) -> Result<(), DomainError> {
        Err(DomainError::Infrastructure(self.error_message.clone()))
    }

    async fn load_messages(
        &self,
        _aggregate_type: &str,
        _aggregate_id: &AggregateId,
    ) -> Result<Vec<Message>, DomainError> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl TransactionalResource for FailingAggregateStore {
    async fn commit(&self, transaction: TransactionId) -> Result<(), DomainError> {
        self.committed.lock().unwrap().push(transaction);
        Ok(())
    }

    async fn rollback(&self, transaction: TransactionId) {
        self.rolled_back.lock().unwrap().push(transaction);
    }
}
