//! Wiring of store, coordinator, dispatcher, unit of work manager and sagas.
//!
//! Committed messages flow from the dispatcher to a composite publisher that
//! fans out to the transport and to the saga manager. The saga manager is
//! attached after the unit of work manager exists, since saga steps run
//! their own transactions through it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;

use keel_core::aggregate::AggregateState;
use keel_core::clock::Clock;
use keel_core::dispatch::{CompositePublisher, MessageDispatcher, Publisher};
use keel_core::error::DomainError;
use keel_core::manager::{Context, UnitOfWorkManager};
use keel_core::repository::{AggregateStore, Repository};
use keel_core::transaction::{LocalTransactionCoordinator, TransactionalResource};
use keel_saga::definition::SagaRegistry;
use keel_saga::manager::SagaManager;
use keel_saga::store::{InMemorySagaStore, SagaStore};
use keel_store::memory::InMemoryAggregateStore;
use keel_store::pg::PgAggregateStore;

use crate::config::KeelConfig;
use crate::error::RuntimeError;

/// Collaborators available to saga definitions while the runtime is built.
pub struct Wiring<'a> {
    /// Coordinator saga steps begin their transactions on.
    pub coordinator: &'a Arc<LocalTransactionCoordinator>,
    /// Unit of work manager repositories resolve through.
    pub manager: &'a Arc<UnitOfWorkManager>,
    /// Runtime clock.
    pub clock: &'a Arc<dyn Clock>,
}

/// A running Keel instance.
pub struct KeelRuntime {
    config: KeelConfig,
    coordinator: Arc<LocalTransactionCoordinator>,
    store: Arc<dyn AggregateStore>,
    dispatcher: Arc<MessageDispatcher>,
    manager: Arc<UnitOfWorkManager>,
    sagas: Arc<SagaManager>,
    clock: Arc<dyn Clock>,
    reaper: JoinHandle<()>,
}

impl fmt::Debug for KeelRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeelRuntime")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("sagas", &self.sagas)
            .finish_non_exhaustive()
    }
}

impl KeelRuntime {
    /// Starts a runtime on the store `config` selects: PostgreSQL when a
    /// database URL is set, in-memory otherwise.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Database` if the pool cannot connect, or
    /// `RuntimeError::Domain` if the schema cannot be created.
    pub async fn start<F>(
        config: KeelConfig,
        transport: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        sagas: F,
    ) -> Result<Self, RuntimeError>
    where
        F: FnOnce(&Wiring<'_>) -> SagaRegistry,
    {
        match config.database_url.clone() {
            Some(url) => {
                let pool = PgPoolOptions::new().max_connections(10).connect(&url).await?;
                let store = Arc::new(PgAggregateStore::new(pool));
                store.ensure_schema().await.map_err(DomainError::from)?;
                tracing::info!("using PostgreSQL aggregate store");
                Ok(Self::with_store(config, store, transport, clock, sagas))
            }
            None => {
                tracing::info!("using in-memory aggregate store");
                let store = Arc::new(InMemoryAggregateStore::new());
                Ok(Self::with_store(config, store, transport, clock, sagas))
            }
        }
    }

    /// Assembles a runtime around `store`, keeping saga state in memory.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn with_store<S, F>(
        config: KeelConfig,
        store: Arc<S>,
        transport: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        sagas: F,
    ) -> Self
    where
        S: AggregateStore + TransactionalResource + 'static,
        F: FnOnce(&Wiring<'_>) -> SagaRegistry,
    {
        Self::with_stores(
            config,
            store,
            Arc::new(InMemorySagaStore::new()),
            transport,
            clock,
            sagas,
        )
    }

    /// Assembles a runtime around an aggregate store and a saga store.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn with_stores<S, F>(
        config: KeelConfig,
        store: Arc<S>,
        saga_store: Arc<dyn SagaStore>,
        transport: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        sagas: F,
    ) -> Self
    where
        S: AggregateStore + TransactionalResource + 'static,
        F: FnOnce(&Wiring<'_>) -> SagaRegistry,
    {
        let coordinator = Arc::new(
            LocalTransactionCoordinator::new(vec![
                Arc::clone(&store) as Arc<dyn TransactionalResource>
            ])
            .with_default_timeout(config.transaction_timeout),
        );
        let reaper = coordinator.spawn_reaper(config.reap_interval);
        let store: Arc<dyn AggregateStore> = store;
        let publisher = Arc::new(CompositePublisher::new().with(Arc::clone(&transport)));
        let dispatcher = Arc::new(MessageDispatcher::spawn(
            Arc::clone(&publisher) as Arc<dyn Publisher>,
            config.dispatch_shards,
        ));
        let manager = Arc::new(UnitOfWorkManager::new(
            coordinator.clone(),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
        ));

        let registry = sagas(&Wiring {
            coordinator: &coordinator,
            manager: &manager,
            clock: &clock,
        });
        let definitions = registry.len();
        let sagas = Arc::new(
            SagaManager::new(registry, saga_store, Arc::clone(&clock))
                .with_max_cascade(config.saga_max_cascade)
                .with_outbound(transport),
        );
        if definitions > 0 {
            publisher.attach(Arc::clone(&sagas) as Arc<dyn Publisher>);
        }

        tracing::info!(
            shards = config.dispatch_shards,
            timeout_ms = config.transaction_timeout.map(|t| t.as_millis()),
            reap_interval_ms = config.reap_interval.as_millis(),
            saga_definitions = definitions,
            max_cascade = config.saga_max_cascade,
            "keel runtime started"
        );
        Self {
            config,
            coordinator,
            store,
            dispatcher,
            manager,
            sagas,
            clock,
            reaper,
        }
    }

    /// The configuration the runtime was built from.
    #[must_use]
    pub fn config(&self) -> &KeelConfig {
        &self.config
    }

    /// The transaction coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<LocalTransactionCoordinator> {
        &self.coordinator
    }

    /// The aggregate store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.store
    }

    /// The unit of work manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<UnitOfWorkManager> {
        &self.manager
    }

    /// The saga manager.
    #[must_use]
    pub fn sagas(&self) -> &Arc<SagaManager> {
        &self.sagas
    }

    /// The runtime clock.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// A repository for aggregates of type `S`.
    #[must_use]
    pub fn repository<S: AggregateState>(&self) -> Repository<S> {
        Repository::new(Arc::clone(&self.manager))
    }

    /// Begins a transaction and returns a context running inside it.
    #[must_use]
    pub fn begin(&self) -> Context {
        Context::new(self.coordinator.begin())
    }

    /// Runs `work` in a new transaction, committing on `Ok` and rolling
    /// back on `Err`.
    ///
    /// # Errors
    ///
    /// Returns the error of `work`, or the commit error.
    pub async fn in_transaction<T, F, Fut>(&self, work: F) -> Result<T, DomainError>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
    {
        let transaction = self.coordinator.begin();
        let result = work(Context::new(transaction)).await;
        self.coordinator.finish(transaction, result).await
    }

    /// Stops accepting messages and waits until everything already queued
    /// has been published. Messages committed afterwards are not published,
    /// and expired transactions are no longer swept.
    pub async fn shutdown(&self) {
        self.reaper.abort();
        self.dispatcher.shutdown().await;
        tracing::info!("keel runtime stopped");
    }
}
