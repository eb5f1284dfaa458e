//! `PostgreSQL` implementation of the `AggregateStore` trait.
//!
//! Each coordinator transaction is backed by one database transaction,
//! opened lazily on first use and finished when the coordinator commits or
//! rolls back the store as a `TransactionalResource`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Executor, PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use uuid::Uuid;

use keel_core::aggregate::AggregateId;
use keel_core::error::DomainError;
use keel_core::lifecycle::LifecyclePhase;
use keel_core::message::Message;
use keel_core::repository::{AggregateStore, StoredAggregate};
use keel_core::transaction::{TransactionId, TransactionalResource};

use crate::memory::DEFAULT_LOCK_TIMEOUT;
use crate::schema::{CREATE_AGGREGATES_TABLE, CREATE_MESSAGES_TABLE};

/// Errors raised by the `PostgreSQL` store.
#[derive(Debug, Error)]
pub enum PgStoreError {
    /// The database rejected a statement.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),
}

impl From<PgStoreError> for DomainError {
    fn from(err: PgStoreError) -> Self {
        DomainError::Infrastructure(err.to_string())
    }
}

type SharedTransaction = Arc<tokio::sync::Mutex<Option<Transaction<'static, Postgres>>>>;

/// PostgreSQL-backed aggregate store.
#[derive(Debug)]
pub struct PgAggregateStore {
    pool: PgPool,
    lock_timeout: Duration,
    open: Mutex<HashMap<TransactionId, SharedTransaction>>,
}

impl PgAggregateStore {
    /// Creates a new `PgAggregateStore`.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the row lock wait applied to every database transaction.
    #[must_use]
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Creates the store's tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `PgStoreError::Database` if the DDL fails.
    pub async fn ensure_schema(&self) -> Result<(), PgStoreError> {
        sqlx::raw_sql(CREATE_AGGREGATES_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::raw_sql(CREATE_MESSAGES_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn take(&self, transaction: TransactionId) -> Option<SharedTransaction> {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&transaction)
    }

    async fn transaction(&self, transaction: TransactionId) -> Result<SharedTransaction, PgStoreError> {
        if let Some(open) = self
            .open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&transaction)
        {
            return Ok(Arc::clone(open));
        }

        let mut db = self.pool.begin().await?;
        let millis = self.lock_timeout.as_millis();
        let set_lock_timeout = format!("SET LOCAL lock_timeout = {millis}");
        let conn: &mut PgConnection = &mut db;
        conn.execute(sqlx::raw_sql(&set_lock_timeout)).await?;
        let created: SharedTransaction = Arc::new(tokio::sync::Mutex::new(Some(db)));

        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        // A concurrent caller on the same transaction may have won the race;
        // the losing database transaction is dropped and rolled back.
        let shared = open.entry(transaction).or_insert(created);
        tracing::debug!(%transaction, "database transaction opened");
        Ok(Arc::clone(shared))
    }
}

fn closed(transaction: TransactionId) -> PgStoreError {
    PgStoreError::CorruptRecord(format!("database transaction for {transaction} already closed"))
}

fn parse_phase(value: &str) -> Result<LifecyclePhase, PgStoreError> {
    LifecyclePhase::parse(value)
        .ok_or_else(|| PgStoreError::CorruptRecord(format!("unknown lifecycle phase {value:?}")))
}

fn aggregate_from_row(row: &PgRow) -> Result<StoredAggregate, PgStoreError> {
    let phase: String = row.try_get("phase")?;
    Ok(StoredAggregate {
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: AggregateId::from(row.try_get::<String, _>("aggregate_id")?),
        version: row.try_get("version")?,
        sequence: row.try_get("sequence")?,
        phase: parse_phase(&phase)?,
        state: row.try_get("state")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message, PgStoreError> {
    let phase: String = row.try_get("phase")?;
    Ok(Message {
        message_id: row.try_get::<Uuid, _>("message_id")?,
        message_type: row.try_get("message_type")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: AggregateId::from(row.try_get::<String, _>("aggregate_id")?),
        aggregate_version: row.try_get("aggregate_version")?,
        sequence_number: row.try_get("sequence_number")?,
        phase: parse_phase(&phase)?,
        effect_immediately: row.try_get("effect_immediately")?,
        queue: row.try_get("queue")?,
        tracking_token: row.try_get("tracking_token")?,
        correlation_id: row.try_get("correlation_id")?,
        payload: row.try_get("payload")?,
        occurred_at: row.try_get::<DateTime<Utc>, _>("occurred_at")?,
    })
}

#[async_trait]
impl AggregateStore for PgAggregateStore {
    async fn load(
        &self,
        transaction: TransactionId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Option<StoredAggregate>, DomainError> {
        let shared = self.transaction(transaction).await?;
        let mut guard = shared.lock().await;
        let db = guard.as_mut().ok_or_else(|| closed(transaction))?;
        let row = sqlx::query(
            "SELECT aggregate_type, aggregate_id, version, sequence, phase, state \
             FROM keel_aggregates WHERE aggregate_type = $1 AND aggregate_id = $2",
        )
        .bind(aggregate_type)
        .bind(aggregate_id.as_str())
        .fetch_optional(&mut **db)
        .await
        .map_err(PgStoreError::from)?;
        Ok(row.as_ref().map(aggregate_from_row).transpose()?)
    }

    async fn lock(
        &self,
        transaction: TransactionId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<(), DomainError> {
        let shared = self.transaction(transaction).await?;
        let mut guard = shared.lock().await;
        let db = guard.as_mut().ok_or_else(|| closed(transaction))?;
        sqlx::query(
            "SELECT 1 FROM keel_aggregates \
             WHERE aggregate_type = $1 AND aggregate_id = $2 FOR UPDATE",
        )
        .bind(aggregate_type)
        .bind(aggregate_id.as_str())
        .fetch_optional(&mut **db)
        .await
        .map_err(PgStoreError::from)?;
        tracing::debug!(%transaction, aggregate_type, %aggregate_id, "row lock acquired");
        Ok(())
    }

    async fn save(
        &self,
        transaction: TransactionId,
        record: &StoredAggregate,
        expected_version: Option<i64>,
    ) -> Result<(), DomainError> {
        let shared = self.transaction(transaction).await?;
        let mut guard = shared.lock().await;
        let db = guard.as_mut().ok_or_else(|| closed(transaction))?;

        let result = match expected_version {
            None => sqlx::query(
                "INSERT INTO keel_aggregates \
                 (aggregate_type, aggregate_id, version, sequence, phase, state) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (aggregate_type, aggregate_id) DO NOTHING",
            )
            .bind(&record.aggregate_type)
            .bind(record.aggregate_id.as_str())
            .bind(record.version)
            .bind(record.sequence)
            .bind(record.phase.as_str())
            .bind(&record.state)
            .execute(&mut **db)
            .await,
            Some(expected) => sqlx::query(
                "UPDATE keel_aggregates \
                 SET version = $3, sequence = $4, phase = $5, state = $6, updated_at = NOW() \
                 WHERE aggregate_type = $1 AND aggregate_id = $2 AND version = $7",
            )
            .bind(&record.aggregate_type)
            .bind(record.aggregate_id.as_str())
            .bind(record.version)
            .bind(record.sequence)
            .bind(record.phase.as_str())
            .bind(&record.state)
            .bind(expected)
            .execute(&mut **db)
            .await,
        }
        .map_err(PgStoreError::from)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let actual: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM keel_aggregates WHERE aggregate_type = $1 AND aggregate_id = $2",
        )
        .bind(&record.aggregate_type)
        .bind(record.aggregate_id.as_str())
        .fetch_optional(&mut **db)
        .await
        .map_err(PgStoreError::from)?;
        Err(DomainError::ConcurrentModification {
            aggregate_type: record.aggregate_type.clone(),
            aggregate_id: record.aggregate_id.clone(),
            expected: expected_version,
            actual,
        })
    }

    async fn append_messages(
        &self,
        transaction: TransactionId,
        messages: &[Message],
    ) -> Result<(), DomainError> {
        if messages.is_empty() {
            return Ok(());
        }
        let shared = self.transaction(transaction).await?;
        let mut guard = shared.lock().await;
        let db = guard.as_mut().ok_or_else(|| closed(transaction))?;
        for message in messages {
            sqlx::query(
                "INSERT INTO keel_messages \
                 (message_id, message_type, aggregate_type, aggregate_id, aggregate_version, \
                  sequence_number, phase, effect_immediately, queue, tracking_token, \
                  correlation_id, payload, occurred_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            )
            .bind(message.message_id)
            .bind(&message.message_type)
            .bind(&message.aggregate_type)
            .bind(message.aggregate_id.as_str())
            .bind(message.aggregate_version)
            .bind(message.sequence_number)
            .bind(message.phase.as_str())
            .bind(message.effect_immediately)
            .bind(message.queue.as_deref())
            .bind(message.tracking_token.as_deref())
            .bind(message.correlation_id)
            .bind(&message.payload)
            .bind(message.occurred_at)
            .execute(&mut **db)
            .await
            .map_err(PgStoreError::from)?;
        }
        Ok(())
    }

    async fn load_messages(
        &self,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<Message>, DomainError> {
        let rows = sqlx::query(
            "SELECT message_id, message_type, aggregate_type, aggregate_id, aggregate_version, \
             sequence_number, phase, effect_immediately, queue, tracking_token, correlation_id, \
             payload, occurred_at \
             FROM keel_messages WHERE aggregate_type = $1 AND aggregate_id = $2 \
             ORDER BY sequence_number",
        )
        .bind(aggregate_type)
        .bind(aggregate_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(PgStoreError::from)?;
        Ok(rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl TransactionalResource for PgAggregateStore {
    async fn commit(&self, transaction: TransactionId) -> Result<(), DomainError> {
        let Some(shared) = self.take(transaction) else {
            return Ok(());
        };
        let Some(db) = shared.lock().await.take() else {
            return Ok(());
        };
        db.commit().await.map_err(PgStoreError::from)?;
        tracing::debug!(%transaction, "database transaction committed");
        Ok(())
    }

    async fn rollback(&self, transaction: TransactionId) {
        let Some(shared) = self.take(transaction) else {
            return;
        };
        let Some(db) = shared.lock().await.take() else {
            return;
        };
        if let Err(err) = db.rollback().await {
            tracing::error!(%transaction, error = %err, "database rollback failed");
        }
    }
}
