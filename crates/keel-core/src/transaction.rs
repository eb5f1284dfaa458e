//! Transaction coordination.
//!
//! A [`TransactionCoordinator`] hands out transaction identities and invokes
//! registered [`Participant`]s exactly once per transaction: every
//! `before_commit` in registration order, then the enlisted
//! [`TransactionalResource`]s commit, then every `after_completion`. A failing
//! `before_commit` rolls the whole transaction back. A transaction whose
//! deadline passes stops being active; [`LocalTransactionCoordinator::reap_expired`]
//! rolls it back so its locks and staged writes are released even if its
//! owner never returns.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::error::DomainError;

/// Identity of an ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Creates a fresh transaction identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The underlying storage committed.
    Committed,
    /// Nothing was made durable.
    RolledBack,
}

/// Receives completion callbacks for one transaction.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Called once, immediately before the underlying transaction commits.
    /// An error rolls the transaction back.
    async fn before_commit(&self) -> Result<(), DomainError>;

    /// Called once, after the transaction has definitively committed or
    /// rolled back.
    async fn after_completion(&self, outcome: Outcome);
}

/// The ambient transaction abstraction the unit of work binds to.
pub trait TransactionCoordinator: Send + Sync {
    /// Returns `true` while `transaction` can still accept work.
    fn is_active(&self, transaction: TransactionId) -> bool;

    /// Registers a participant for `transaction`'s completion callbacks.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::TransactionNotActive` if the transaction is
    /// unknown or already completing.
    fn register_participant(
        &self,
        transaction: TransactionId,
        participant: Arc<dyn Participant>,
    ) -> Result<(), DomainError>;
}

/// A storage resource whose writes are scoped to a transaction.
#[async_trait]
pub trait TransactionalResource: Send + Sync {
    /// Makes the writes staged under `transaction` durable.
    async fn commit(&self, transaction: TransactionId) -> Result<(), DomainError>;

    /// Discards the writes staged under `transaction` and releases its locks.
    async fn rollback(&self, transaction: TransactionId);
}

/// How long an expired transaction is remembered, so that its owner
/// learns it timed out rather than that it never existed.
const EXPIRED_RETENTION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    Completing,
}

struct Entry {
    status: Status,
    deadline: Option<Instant>,
    participants: Vec<Arc<dyn Participant>>,
}

impl Entry {
    fn is_active(&self, now: Instant) -> bool {
        self.status == Status::Active && self.deadline.is_none_or(|deadline| now < deadline)
    }
}

#[derive(Default)]
struct Table {
    live: HashMap<TransactionId, Entry>,
    expired: HashMap<TransactionId, Instant>,
}

enum Claim {
    Live(Vec<Arc<dyn Participant>>, Option<Instant>),
    Expired,
}

/// In-process coordinator over a fixed set of transactional resources.
pub struct LocalTransactionCoordinator {
    resources: Vec<Arc<dyn TransactionalResource>>,
    default_timeout: Option<Duration>,
    transactions: Mutex<Table>,
}

impl fmt::Debug for LocalTransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransactionCoordinator")
            .field("resources", &self.resources.len())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl LocalTransactionCoordinator {
    /// Creates a coordinator enlisting `resources` in every transaction.
    #[must_use]
    pub fn new(resources: Vec<Arc<dyn TransactionalResource>>) -> Self {
        Self {
            resources,
            default_timeout: None,
            transactions: Mutex::new(Table::default()),
        }
    }

    /// Applies `timeout` to transactions started with [`begin`](Self::begin).
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Starts a transaction with the default timeout.
    pub fn begin(&self) -> TransactionId {
        self.start(self.default_timeout)
    }

    /// Starts a transaction that must finish pre-commit within `timeout`.
    pub fn begin_with_timeout(&self, timeout: Duration) -> TransactionId {
        self.start(Some(timeout))
    }

    fn start(&self, timeout: Option<Duration>) -> TransactionId {
        let transaction = TransactionId::new();
        let entry = Entry {
            status: Status::Active,
            deadline: timeout.map(|t| Instant::now() + t),
            participants: Vec::new(),
        };
        self.table().live.insert(transaction, entry);
        tracing::debug!(%transaction, ?timeout, "transaction started");
        transaction
    }

    fn table(&self) -> std::sync::MutexGuard<'_, Table> {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the transaction as completing and returns its participants.
    fn claim(&self, transaction: TransactionId) -> Result<Claim, DomainError> {
        let mut table = self.table();
        if table.expired.remove(&transaction).is_some() {
            return Ok(Claim::Expired);
        }
        match table.live.get_mut(&transaction) {
            Some(entry) if entry.status == Status::Active => {
                entry.status = Status::Completing;
                Ok(Claim::Live(entry.participants.clone(), entry.deadline))
            }
            _ => Err(DomainError::TransactionNotActive(transaction)),
        }
    }

    /// Rolls the resources back again for a transaction that was reaped
    /// while its owner was still using it.
    async fn discard_late_writes(&self, transaction: TransactionId) {
        for resource in &self.resources {
            resource.rollback(transaction).await;
        }
    }

    /// Commits `transaction`.
    ///
    /// # Errors
    ///
    /// Returns the first `before_commit` or resource commit error (after
    /// rolling back), `DomainError::TransactionTimedOut` if the deadline
    /// elapsed first, or `DomainError::TransactionNotActive` if the
    /// transaction is unknown or already completing.
    pub async fn commit(&self, transaction: TransactionId) -> Result<(), DomainError> {
        let (participants, deadline) = match self.claim(transaction)? {
            Claim::Live(participants, deadline) => (participants, deadline),
            Claim::Expired => {
                self.discard_late_writes(transaction).await;
                return Err(DomainError::TransactionTimedOut(transaction));
            }
        };
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            tracing::warn!(%transaction, "transaction deadline elapsed before pre-commit");
            self.abort(transaction, &participants).await;
            return Err(DomainError::TransactionTimedOut(transaction));
        }

        for participant in &participants {
            let prepared = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, participant.before_commit()).await {
                        Ok(result) => result,
                        Err(_elapsed) => Err(DomainError::TransactionTimedOut(transaction)),
                    }
                }
                None => participant.before_commit().await,
            };
            if let Err(err) = prepared {
                tracing::warn!(%transaction, error = %err, "pre-commit failed, rolling back");
                self.abort(transaction, &participants).await;
                return Err(err);
            }
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            tracing::warn!(%transaction, "transaction deadline elapsed before commit");
            self.abort(transaction, &participants).await;
            return Err(DomainError::TransactionTimedOut(transaction));
        }

        for resource in &self.resources {
            if let Err(err) = resource.commit(transaction).await {
                tracing::error!(%transaction, error = %err, "resource commit failed, rolling back");
                self.abort(transaction, &participants).await;
                return Err(err);
            }
        }

        self.table().live.remove(&transaction);
        tracing::debug!(%transaction, "transaction committed");
        for participant in &participants {
            participant.after_completion(Outcome::Committed).await;
        }
        Ok(())
    }

    /// Rolls `transaction` back. Rolling back a transaction that already
    /// expired succeeds.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::TransactionNotActive` if the transaction is
    /// unknown or already completing.
    pub async fn rollback(&self, transaction: TransactionId) -> Result<(), DomainError> {
        match self.claim(transaction)? {
            Claim::Live(participants, _) => self.abort(transaction, &participants).await,
            Claim::Expired => self.discard_late_writes(transaction).await,
        }
        Ok(())
    }

    /// Rolls back every active transaction whose deadline has passed and
    /// returns how many there were. A later `commit` of such a transaction
    /// fails with `DomainError::TransactionTimedOut`.
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(TransactionId, Vec<Arc<dyn Participant>>)> = {
            let mut table = self.table();
            let Table { live, expired: tombstones } = &mut *table;
            tombstones.retain(|_, at| now.duration_since(*at) < EXPIRED_RETENTION);
            live.iter_mut()
                .filter(|(_, entry)| {
                    entry.status == Status::Active
                        && entry.deadline.is_some_and(|deadline| now >= deadline)
                })
                .map(|(transaction, entry)| {
                    entry.status = Status::Completing;
                    tombstones.insert(*transaction, now);
                    (*transaction, entry.participants.clone())
                })
                .collect()
        };
        for (transaction, participants) in &expired {
            tracing::warn!(%transaction, "transaction deadline elapsed, rolling back");
            self.abort(*transaction, participants).await;
        }
        expired.len()
    }

    /// Spawns a task calling [`reap_expired`](Self::reap_expired) every
    /// `interval`. The task ends once the coordinator is dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.reap_expired().await;
            }
        })
    }

    /// Commits `transaction` if `result` is `Ok`, otherwise rolls it back
    /// and returns the original error.
    ///
    /// # Errors
    ///
    /// Returns the error carried by `result`, or the commit error.
    pub async fn finish<T>(
        &self,
        transaction: TransactionId,
        result: Result<T, DomainError>,
    ) -> Result<T, DomainError> {
        match result {
            Ok(value) => {
                self.commit(transaction).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback(transaction).await {
                    tracing::warn!(%transaction, error = %rollback_err, "rollback after failure was not applied");
                }
                Err(err)
            }
        }
    }

    async fn abort(&self, transaction: TransactionId, participants: &[Arc<dyn Participant>]) {
        for resource in &self.resources {
            resource.rollback(transaction).await;
        }
        self.table().live.remove(&transaction);
        tracing::debug!(%transaction, "transaction rolled back");
        for participant in participants {
            participant.after_completion(Outcome::RolledBack).await;
        }
    }
}

impl TransactionCoordinator for LocalTransactionCoordinator {
    fn is_active(&self, transaction: TransactionId) -> bool {
        let now = Instant::now();
        self.table()
            .live
            .get(&transaction)
            .is_some_and(|entry| entry.is_active(now))
    }

    fn register_participant(
        &self,
        transaction: TransactionId,
        participant: Arc<dyn Participant>,
    ) -> Result<(), DomainError> {
        let now = Instant::now();
        let mut table = self.table();
        match table.live.get_mut(&transaction) {
            Some(entry) if entry.is_active(now) => {
                entry.participants.push(participant);
                Ok(())
            }
            _ => Err(DomainError::TransactionNotActive(transaction)),
        }
    }
}
