//! In-memory implementation of the `AggregateStore` trait.
//!
//! Writes are staged per transaction and applied atomically on commit.
//! A row written by one in-flight transaction cannot be written by another;
//! the second writer fails with `ConcurrentModification`. Row locks are
//! asynchronous mutexes held until the owning transaction completes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use keel_core::aggregate::AggregateId;
use keel_core::error::DomainError;
use keel_core::message::Message;
use keel_core::repository::{AggregateStore, StoredAggregate};
use keel_core::transaction::{TransactionId, TransactionalResource};

/// Default time a transaction waits for a row lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

type RowKey = (String, AggregateId);

fn row_key(aggregate_type: &str, aggregate_id: &AggregateId) -> RowKey {
    (aggregate_type.to_owned(), aggregate_id.clone())
}

#[derive(Default)]
struct Staged {
    rows: HashMap<RowKey, StoredAggregate>,
    messages: Vec<Message>,
    locks: HashMap<RowKey, OwnedMutexGuard<()>>,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<RowKey, StoredAggregate>,
    messages: HashMap<RowKey, Vec<Message>>,
    staged: HashMap<TransactionId, Staged>,
}

/// Transactional in-memory aggregate and message store.
pub struct InMemoryAggregateStore {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
    lock_timeout: Duration,
}

impl fmt::Debug for InMemoryAggregateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryAggregateStore")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryAggregateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAggregateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            row_locks: Mutex::new(HashMap::new()),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets how long a transaction waits for a row lock.
    #[must_use]
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn row_lock(&self, key: &RowKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Drops the lock entries of `keys` that nobody holds or waits for.
    fn prune_row_locks<'a>(&self, keys: impl IntoIterator<Item = &'a RowKey>) {
        let mut locks = self.row_locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(key);
            }
        }
    }

    /// Releases the row locks of a finished transaction.
    fn release(&self, locks: HashMap<RowKey, OwnedMutexGuard<()>>) {
        let keys: Vec<RowKey> = locks.keys().cloned().collect();
        drop(locks);
        self.prune_row_locks(&keys);
    }

    /// Number of rows with a lock entry, held or not.
    #[must_use]
    pub fn row_lock_count(&self) -> usize {
        self.row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of committed aggregate rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables().rows.len()
    }

    /// Number of transactions with staged writes or locks.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.tables().staged.len()
    }
}

#[async_trait]
impl AggregateStore for InMemoryAggregateStore {
    async fn load(
        &self,
        transaction: TransactionId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Option<StoredAggregate>, DomainError> {
        let key = row_key(aggregate_type, aggregate_id);
        let tables = self.tables();
        let own = tables
            .staged
            .get(&transaction)
            .and_then(|staged| staged.rows.get(&key));
        Ok(own.or_else(|| tables.rows.get(&key)).cloned())
    }

    async fn lock(
        &self,
        transaction: TransactionId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<(), DomainError> {
        let key = row_key(aggregate_type, aggregate_id);
        let already_held = self
            .tables()
            .staged
            .get(&transaction)
            .is_some_and(|staged| staged.locks.contains_key(&key));
        if already_held {
            return Ok(());
        }

        let row_lock = self.row_lock(&key);
        let acquired = tokio::time::timeout(self.lock_timeout, row_lock.lock_owned()).await;
        let Ok(guard) = acquired else {
            self.prune_row_locks([&key]);
            return Err(DomainError::Infrastructure(format!(
                "timed out waiting for row lock on {aggregate_type} {aggregate_id}"
            )));
        };
        tracing::debug!(%transaction, aggregate_type, %aggregate_id, "row lock acquired");
        self.tables()
            .staged
            .entry(transaction)
            .or_default()
            .locks
            .insert(key, guard);
        Ok(())
    }

    async fn save(
        &self,
        transaction: TransactionId,
        record: &StoredAggregate,
        expected_version: Option<i64>,
    ) -> Result<(), DomainError> {
        let key = row_key(&record.aggregate_type, &record.aggregate_id);
        let mut tables = self.tables();
        let conflict = |actual: Option<i64>| DomainError::ConcurrentModification {
            aggregate_type: record.aggregate_type.clone(),
            aggregate_id: record.aggregate_id.clone(),
            expected: expected_version,
            actual,
        };

        let written_elsewhere = tables
            .staged
            .iter()
            .any(|(other, staged)| *other != transaction && staged.rows.contains_key(&key));
        if written_elsewhere {
            return Err(conflict(None));
        }
        let actual = tables.rows.get(&key).map(|row| row.version);
        if actual != expected_version {
            return Err(conflict(actual));
        }

        tables
            .staged
            .entry(transaction)
            .or_default()
            .rows
            .insert(key, record.clone());
        Ok(())
    }

    async fn append_messages(
        &self,
        transaction: TransactionId,
        messages: &[Message],
    ) -> Result<(), DomainError> {
        let mut tables = self.tables();
        for message in messages {
            let key = row_key(&message.aggregate_type, &message.aggregate_id);
            let duplicate = tables.messages.get(&key).is_some_and(|stored| {
                stored
                    .iter()
                    .any(|m| m.sequence_number == message.sequence_number)
            });
            if duplicate {
                return Err(DomainError::Infrastructure(format!(
                    "duplicate message sequence {} for {} {}",
                    message.sequence_number, message.aggregate_type, message.aggregate_id
                )));
            }
        }
        tables
            .staged
            .entry(transaction)
            .or_default()
            .messages
            .extend_from_slice(messages);
        Ok(())
    }

    async fn load_messages(
        &self,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<Message>, DomainError> {
        let key = row_key(aggregate_type, aggregate_id);
        Ok(self.tables().messages.get(&key).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl TransactionalResource for InMemoryAggregateStore {
    async fn commit(&self, transaction: TransactionId) -> Result<(), DomainError> {
        let mut tables = self.tables();
        let Some(staged) = tables.staged.remove(&transaction) else {
            return Ok(());
        };
        let rows = staged.rows.len();
        let message_count = staged.messages.len();
        tables.rows.extend(staged.rows);
        for message in staged.messages {
            let key = row_key(&message.aggregate_type, &message.aggregate_id);
            tables.messages.entry(key).or_default().push(message);
        }
        drop(tables);
        self.release(staged.locks);
        tracing::debug!(%transaction, rows, messages = message_count, "in-memory store committed");
        Ok(())
    }

    async fn rollback(&self, transaction: TransactionId) {
        let staged = self.tables().staged.remove(&transaction);
        if let Some(staged) = staged {
            self.release(staged.locks);
            tracing::debug!(%transaction, "in-memory store rolled back");
        }
    }
}
