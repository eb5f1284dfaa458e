//! The saga manager: correlation, step application and compensation.
//!
//! Messages reach the manager after their transaction committed, so a
//! failing step never rolls anything back. It is recorded on the saga, and
//! its compensating message, if any, is fed back through [`SagaManager::trigger`]
//! like any other message.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use keel_core::aggregate::AggregateId;
use keel_core::clock::Clock;
use keel_core::dispatch::Publisher;
use keel_core::error::DomainError;
use keel_core::lifecycle::LifecyclePhase;
use keel_core::message::{Message, MessageOrigin};

use crate::definition::{SagaDefinition, SagaRegistry, StepContext};
use crate::saga::{Saga, SagaKey, StepFailure};
use crate::store::SagaStore;

/// Aggregate type stamped on messages emitted by sagas.
pub const SAGA_AGGREGATE_TYPE: &str = "saga";

/// Default bound on compensation hops per triggering message.
pub const DEFAULT_MAX_CASCADE: usize = 16;

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Begins and advances sagas in reaction to committed messages.
pub struct SagaManager {
    registry: SagaRegistry,
    store: Arc<dyn SagaStore>,
    clock: Arc<dyn Clock>,
    max_cascade: usize,
    outbound: Option<Arc<dyn Publisher>>,
    key_locks: Mutex<HashMap<SagaKey, KeyLock>>,
}

impl fmt::Debug for SagaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaManager")
            .field("definitions", &self.registry.len())
            .field("max_cascade", &self.max_cascade)
            .finish_non_exhaustive()
    }
}

impl SagaManager {
    /// Creates a manager over `registry`, persisting through `store`.
    #[must_use]
    pub fn new(registry: SagaRegistry, store: Arc<dyn SagaStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            store,
            clock,
            max_cascade: DEFAULT_MAX_CASCADE,
            outbound: None,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Bounds how many times emitted messages are fed back per trigger.
    #[must_use]
    pub fn with_max_cascade(mut self, max_cascade: usize) -> Self {
        self.max_cascade = max_cascade;
        self
    }

    /// Also hands every saga-emitted message to `publisher`.
    #[must_use]
    pub fn with_outbound(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.outbound = Some(publisher);
        self
    }

    /// Matches `message` against the registered definitions and begins or
    /// advances one saga per match. Messages emitted by the steps are
    /// handled in turn, up to the cascade bound.
    ///
    /// Returns the keys of every saga that applied a step, in order.
    ///
    /// # Errors
    ///
    /// Returns the saga store's error. Step failures are not errors.
    pub async fn trigger(&self, message: &Message) -> Result<Vec<SagaKey>, DomainError> {
        let mut touched = Vec::new();
        let mut pending = VecDeque::from([(message.clone(), 0_usize)]);
        while let Some((current, depth)) = pending.pop_front() {
            if depth > self.max_cascade {
                tracing::warn!(
                    message_id = %current.message_id,
                    message_type = %current.message_type,
                    max_cascade = self.max_cascade,
                    "saga cascade limit reached, message dropped"
                );
                continue;
            }
            for definition in self.registry.matching(&current) {
                if let Some((key, emitted)) = self.apply(definition, &current).await? {
                    touched.push(key);
                    pending.extend(emitted.into_iter().map(|m| (m, depth + 1)));
                }
            }
        }
        Ok(touched)
    }

    /// Durably stores saga progress.
    ///
    /// # Errors
    ///
    /// Returns the saga store's error.
    pub async fn persist(&self, saga: &Saga) -> Result<(), DomainError> {
        self.store.save(saga).await?;
        tracing::debug!(saga = %saga.key(), step = saga.step(), completed = saga.is_completed(), "saga persisted");
        Ok(())
    }

    /// All sagas that have handled a message of `aggregate_id`.
    ///
    /// # Errors
    ///
    /// Returns the saga store's error.
    pub async fn select(&self, aggregate_id: &AggregateId) -> Result<Vec<Saga>, DomainError> {
        self.store.find_by_aggregate(aggregate_id).await
    }

    /// The saga stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns the saga store's error.
    pub async fn find(&self, key: &SagaKey) -> Result<Option<Saga>, DomainError> {
        self.store.load(key).await
    }

    fn key_lock(&self, key: &SagaKey) -> KeyLock {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn release_key_lock(&self, key: &SagaKey) {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    fn key_for(definition: &SagaDefinition, message: &Message) -> Option<SagaKey> {
        match &message.tracking_token {
            Some(token) => Some(SagaKey::new(definition.queue(), token.clone())),
            None if definition.initiates(message) => {
                Some(SagaKey::new(definition.queue(), Uuid::now_v7().to_string()))
            }
            None => None,
        }
    }

    async fn apply(
        &self,
        definition: &SagaDefinition,
        message: &Message,
    ) -> Result<Option<(SagaKey, Vec<Message>)>, DomainError> {
        let Some(key) = Self::key_for(definition, message) else {
            tracing::debug!(saga = definition.name(), message_type = %message.message_type, "untracked message does not initiate");
            return Ok(None);
        };
        let lock = self.key_lock(&key);
        let result = {
            let _held = lock.lock().await;
            self.apply_locked(definition, key.clone(), message).await
        };
        drop(lock);
        self.release_key_lock(&key);
        result
    }

    async fn apply_locked(
        &self,
        definition: &SagaDefinition,
        key: SagaKey,
        message: &Message,
    ) -> Result<Option<(SagaKey, Vec<Message>)>, DomainError> {
        let mut saga = match self.store.load(&key).await? {
            Some(saga) if saga.definition() != definition.name() => {
                tracing::debug!(saga = %key, "key belongs to another definition");
                return Ok(None);
            }
            Some(saga) if saga.is_completed() => {
                tracing::debug!(saga = %key, message_id = %message.message_id, "saga completed, message ignored");
                return Ok(None);
            }
            Some(saga) if saga.has_seen(message) => {
                tracing::debug!(
                    saga = %key,
                    aggregate_id = %message.aggregate_id,
                    sequence_number = message.sequence_number,
                    "duplicate delivery ignored"
                );
                return Ok(None);
            }
            Some(saga) => saga,
            None if definition.initiates(message) => {
                tracing::info!(saga = %key, definition = definition.name(), "saga begun");
                Saga::begin(definition.name(), key.clone(), self.clock.now())
            }
            None => {
                tracing::debug!(saga = %key, message_type = %message.message_type, "no saga for key");
                return Ok(None);
            }
        };

        saga.observe(message);
        let before_step = saga.clone();
        let handler = definition.handler();
        let mut step = StepContext::new(&mut saga);
        let outcome = handler.handle(&mut step, message).await;
        let mut drafts = step.into_emitted();

        if let Err(err) = outcome {
            saga = before_step;
            let now = self.clock.now();
            let step_number = saga.finish_step(now);
            let failure = DomainError::SagaStepFailure {
                saga_id: saga.id(),
                step: step_number,
                reason: err.reason().to_owned(),
            };
            tracing::error!(saga = %key, message_id = %message.message_id, error = %failure, "saga step failed");
            saga.record_failure(StepFailure {
                step: step_number,
                message_id: message.message_id,
                reason: err.reason().to_owned(),
                failed_at: now,
            });
            drafts = err.into_compensation().into_iter().collect();
        } else {
            saga.finish_step(self.clock.now());
        }

        let now = self.clock.now();
        let emitted: Vec<Message> = drafts
            .into_iter()
            .map(|draft| {
                let mut draft = if draft.queue().is_none() {
                    draft.routed_to(key.queue.clone(), key.token.clone())
                } else {
                    draft
                };
                if let Some(correlation_id) = message.correlation_id {
                    draft = draft.correlated(correlation_id);
                }
                let origin = MessageOrigin {
                    aggregate_type: SAGA_AGGREGATE_TYPE.to_owned(),
                    aggregate_id: AggregateId::from(saga.id().to_string()),
                    aggregate_version: saga.step(),
                    sequence_number: saga.next_emission(),
                    phase: LifecyclePhase::Enabled,
                };
                draft.into_message(origin, now)
            })
            .collect();

        self.persist(&saga).await?;
        tracing::info!(
            saga = %key,
            step = saga.step(),
            completed = saga.is_completed(),
            emitted = emitted.len(),
            "saga advanced"
        );
        self.publish_outbound(&emitted).await;
        Ok(Some((key, emitted)))
    }

    async fn publish_outbound(&self, emitted: &[Message]) {
        let Some(outbound) = &self.outbound else {
            return;
        };
        for message in emitted {
            if let Err(err) = outbound.publish(message, message.ordering_key()).await {
                tracing::error!(message_id = %message.message_id, error = %err, "saga message publication failed");
            }
        }
    }
}

#[async_trait]
impl Publisher for SagaManager {
    async fn publish(&self, message: &Message, _ordering_key: &AggregateId) -> Result<(), DomainError> {
        self.trigger(message).await.map(|_| ())
    }
}
