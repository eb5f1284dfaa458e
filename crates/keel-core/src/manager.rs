//! Binding of units of work to transactions.
//!
//! Callers thread a [`Context`] through their call chains instead of relying
//! on thread-local state. The [`UnitOfWorkManager`] keys bindings by the
//! context's transaction, so all callers sharing a transaction share one
//! unit of work.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use uuid::Uuid;

use crate::dispatch::MessageDispatcher;
use crate::error::DomainError;
use crate::repository::AggregateStore;
use crate::transaction::{TransactionCoordinator, TransactionId};
use crate::unit_of_work::{UnitOfWork, UnitOfWorkState};

pub(crate) type BindingTable = Mutex<HashMap<TransactionId, Arc<UnitOfWork>>>;

/// Explicit execution context: the ambient transaction, a correlation ID,
/// and the unit of work once resolved.
#[derive(Debug, Clone)]
pub struct Context {
    transaction: Option<TransactionId>,
    correlation_id: Uuid,
    unit_of_work: OnceLock<Arc<UnitOfWork>>,
}

impl Context {
    /// A context running inside `transaction`.
    #[must_use]
    pub fn new(transaction: TransactionId) -> Self {
        Self {
            transaction: Some(transaction),
            correlation_id: Uuid::now_v7(),
            unit_of_work: OnceLock::new(),
        }
    }

    /// A context outside any transaction.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            transaction: None,
            correlation_id: Uuid::now_v7(),
            unit_of_work: OnceLock::new(),
        }
    }

    /// Replaces the correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// The ambient transaction, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<TransactionId> {
        self.transaction
    }

    /// Correlation ID for messages caused by work in this context.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

/// Where a context stands with respect to unit of work binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// No unit of work bound.
    Unbound,
    /// A unit of work is bound and in the given state.
    Bound(UnitOfWorkState),
}

/// Binds exactly one unit of work per transaction.
pub struct UnitOfWorkManager {
    coordinator: Arc<dyn TransactionCoordinator>,
    store: Arc<dyn AggregateStore>,
    dispatcher: Arc<MessageDispatcher>,
    bindings: Arc<BindingTable>,
}

impl fmt::Debug for UnitOfWorkManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWorkManager")
            .field("bound", &self.bound_count())
            .finish_non_exhaustive()
    }
}

impl UnitOfWorkManager {
    /// Creates a manager whose units of work write through `store` and
    /// publish through `dispatcher`.
    #[must_use]
    pub fn new(
        coordinator: Arc<dyn TransactionCoordinator>,
        store: Arc<dyn AggregateStore>,
        dispatcher: Arc<MessageDispatcher>,
    ) -> Self {
        Self {
            coordinator,
            store,
            dispatcher,
            bindings: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The store units of work write through.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.store
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<TransactionId, Arc<UnitOfWork>>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the unit of work bound to the context's transaction, creating
    /// and registering it with the coordinator on first use.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NoActiveTransaction` if the context carries no
    /// transaction or the transaction is no longer active, or the
    /// coordinator's registration error.
    pub fn current(&self, ctx: &Context) -> Result<Arc<UnitOfWork>, DomainError> {
        let transaction = ctx.transaction().ok_or(DomainError::NoActiveTransaction)?;
        if !self.coordinator.is_active(transaction) {
            return Err(DomainError::NoActiveTransaction);
        }
        if let Some(unit_of_work) = ctx.unit_of_work.get() {
            return Ok(Arc::clone(unit_of_work));
        }

        let mut table = self.table();
        let unit_of_work = if let Some(existing) = table.get(&transaction) {
            Arc::clone(existing)
        } else {
            let created = Arc::new(UnitOfWork::new(
                transaction,
                Arc::clone(&self.store),
                Arc::clone(&self.dispatcher),
                Arc::downgrade(&self.bindings),
            ));
            self.coordinator
                .register_participant(transaction, created.clone())?;
            table.insert(transaction, Arc::clone(&created));
            tracing::debug!(%transaction, "unit of work bound");
            created
        };
        drop(table);

        let _ = ctx.unit_of_work.set(Arc::clone(&unit_of_work));
        Ok(unit_of_work)
    }

    /// Binding state of the context's transaction.
    #[must_use]
    pub fn binding(&self, ctx: &Context) -> Binding {
        ctx.transaction()
            .and_then(|transaction| self.table().get(&transaction).map(|uow| uow.state()))
            .map_or(Binding::Unbound, Binding::Bound)
    }

    /// Clears a leftover binding for a context whose transaction is no
    /// longer active. Returns `true` if one was cleared.
    pub fn release(&self, ctx: &Context) -> bool {
        let Some(transaction) = ctx.transaction() else {
            return false;
        };
        if self.coordinator.is_active(transaction) {
            return false;
        }
        let released = self.table().remove(&transaction).is_some();
        if released {
            tracing::warn!(%transaction, "cleared leftover unit of work binding");
        }
        released
    }

    /// Number of currently bound units of work.
    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.table().len()
    }
}
