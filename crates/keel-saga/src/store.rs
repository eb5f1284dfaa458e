//! Saga persistence.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use keel_core::aggregate::AggregateId;
use keel_core::error::DomainError;

use crate::saga::{Saga, SagaKey};

/// Durable store of saga records keyed by `(queue, tracking token)`.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Loads the saga stored under `key`.
    async fn load(&self, key: &SagaKey) -> Result<Option<Saga>, DomainError>;

    /// Inserts or replaces the saga under its key.
    async fn save(&self, saga: &Saga) -> Result<(), DomainError>;

    /// All sagas that have handled a message of `aggregate_id`.
    async fn find_by_aggregate(&self, aggregate_id: &AggregateId) -> Result<Vec<Saga>, DomainError>;
}

/// In-process saga store.
#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    sagas: Mutex<HashMap<SagaKey, Saga>>,
}

impl InMemorySagaStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sagas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sagas.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if no saga is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn load(&self, key: &SagaKey) -> Result<Option<Saga>, DomainError> {
        Ok(self
            .sagas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn save(&self, saga: &Saga) -> Result<(), DomainError> {
        self.sagas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(saga.key().clone(), saga.clone());
        Ok(())
    }

    async fn find_by_aggregate(&self, aggregate_id: &AggregateId) -> Result<Vec<Saga>, DomainError> {
        let mut found: Vec<Saga> = self
            .sagas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|saga| saga.aggregates().contains(aggregate_id))
            .cloned()
            .collect();
        found.sort_by_key(Saga::started_at);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_save_replaces_saga_under_same_key() {
        // Arrange
        let store = InMemorySagaStore::new();
        let key = SagaKey::new("order", "T1");
        let mut saga = Saga::begin("fulfilment", key.clone(), Utc::now());
        store.save(&saga).await.unwrap();

        // Act
        saga.finish_step(Utc::now());
        store.save(&saga).await.unwrap();
        let loaded = store.load(&key).await.unwrap();

        // Assert
        assert_eq!(store.len(), 1);
        assert_eq!(loaded.map(|s| s.step()), Some(1));
    }

    #[tokio::test]
    async fn test_load_missing_key_returns_none() {
        let store = InMemorySagaStore::new();

        let loaded = store.load(&SagaKey::new("order", "missing")).await.unwrap();

        assert!(loaded.is_none());
        assert!(store.is_empty());
    }
}
