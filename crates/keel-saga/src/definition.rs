//! Saga definitions and the registry they are looked up in.
//!
//! A definition pairs a predicate over messages with a factory for the
//! handler that applies one step. The registry indexes definitions by the
//! message types they listen to; definitions listening to every type sit in
//! a separate wildcard list.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use keel_core::error::DomainError;
use keel_core::message::{Message, MessageDraft};

use crate::saga::{Saga, SagaKey};

/// A failed saga step. The optional compensation is emitted in place of the
/// step's other output.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct SagaStepError {
    reason: String,
    compensation: Option<MessageDraft>,
}

impl SagaStepError {
    /// A failure without compensation.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            compensation: None,
        }
    }

    /// Attaches a compensating message.
    #[must_use]
    pub fn with_compensation(mut self, draft: MessageDraft) -> Self {
        self.compensation = Some(draft);
        self
    }

    /// Handler-provided reason.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub(crate) fn into_compensation(self) -> Option<MessageDraft> {
        self.compensation
    }
}

impl From<DomainError> for SagaStepError {
    fn from(err: DomainError) -> Self {
        Self::new(err.to_string())
    }
}

/// What a step handler sees of its saga.
pub struct StepContext<'a> {
    saga: &'a mut Saga,
    emitted: Vec<MessageDraft>,
}

impl fmt::Debug for StepContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("saga", &self.saga.id())
            .field("emitted", &self.emitted.len())
            .finish()
    }
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(saga: &'a mut Saga) -> Self {
        Self {
            saga,
            emitted: Vec::new(),
        }
    }

    /// The saga's identifier.
    #[must_use]
    pub fn saga_id(&self) -> Uuid {
        self.saga.id()
    }

    /// The saga's correlation key.
    #[must_use]
    pub fn key(&self) -> &SagaKey {
        self.saga.key()
    }

    /// Steps applied before this one.
    #[must_use]
    pub fn step(&self) -> i64 {
        self.saga.step()
    }

    /// Raw saga state.
    #[must_use]
    pub fn state(&self) -> &serde_json::Value {
        self.saga.state()
    }

    /// Saga state as `T`, or `T::default()` before the first write.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the stored state does not
    /// match `T`.
    pub fn state_as<T: DeserializeOwned + Default>(&self) -> Result<T, DomainError> {
        if self.saga.state().is_null() {
            return Ok(T::default());
        }
        Ok(serde_json::from_value(self.saga.state().clone())?)
    }

    /// Replaces the saga state.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if `state` cannot be serialized.
    pub fn set_state(&mut self, state: &impl Serialize) -> Result<(), DomainError> {
        self.saga.set_state(serde_json::to_value(state)?);
        Ok(())
    }

    /// Marks the process finished; later messages for its key are ignored.
    pub fn complete(&mut self) {
        self.saga.complete();
    }

    /// Emits a message once the step has been persisted. Drafts without a
    /// queue are routed back to this saga.
    pub fn emit(&mut self, draft: MessageDraft) {
        self.emitted.push(draft);
    }

    pub(crate) fn into_emitted(self) -> Vec<MessageDraft> {
        self.emitted
    }
}

/// Applies one saga step.
#[async_trait]
pub trait SagaHandler: Send + Sync {
    /// Handles `message` for the saga behind `step`. Handlers must tolerate
    /// redelivery of messages the saga has not yet persisted.
    async fn handle(&self, step: &mut StepContext<'_>, message: &Message)
    -> Result<(), SagaStepError>;
}

type Predicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;
type HandlerFactory = Arc<dyn Fn() -> Box<dyn SagaHandler> + Send + Sync>;

/// Which message types a definition listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePattern {
    /// The listed message types.
    Types(Vec<String>),
    /// Every message type.
    Any,
}

/// A saga type: the messages it reacts to, when it starts, and its handler.
#[derive(Clone)]
pub struct SagaDefinition {
    name: String,
    queue: String,
    pattern: MessagePattern,
    initiates: Predicate,
    factory: HandlerFactory,
}

impl fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

impl SagaDefinition {
    /// Creates a definition listening on `queue` for `pattern`. By default
    /// no message initiates a saga.
    pub fn new<F, H>(
        name: impl Into<String>,
        queue: impl Into<String>,
        pattern: MessagePattern,
        factory: F,
    ) -> Self
    where
        F: Fn() -> H + Send + Sync + 'static,
        H: SagaHandler + 'static,
    {
        Self {
            name: name.into(),
            queue: queue.into(),
            pattern,
            initiates: Arc::new(|_| false),
            factory: Arc::new(move || -> Box<dyn SagaHandler> { Box::new(factory()) }),
        }
    }

    /// Messages of `message_type` begin a new saga when none exists for
    /// their key.
    #[must_use]
    pub fn initiated_by(self, message_type: impl Into<String>) -> Self {
        let message_type = message_type.into();
        self.initiated_when(move |message| message.message_type == message_type)
    }

    /// Messages matching `predicate` begin a new saga when none exists for
    /// their key.
    #[must_use]
    pub fn initiated_when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.initiates = Arc::new(predicate);
        self
    }

    /// Definition name, recorded on every saga it drives.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue this definition listens on.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Returns `true` if `message` is addressed to this definition: its type
    /// matches and it is either unrouted or routed to this queue.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        let type_matches = match &self.pattern {
            MessagePattern::Any => true,
            MessagePattern::Types(types) => types.iter().any(|t| *t == message.message_type),
        };
        type_matches && message.queue.as_deref().is_none_or(|queue| queue == self.queue)
    }

    /// Returns `true` if `message` may begin a saga.
    #[must_use]
    pub fn initiates(&self, message: &Message) -> bool {
        (self.initiates)(message)
    }

    /// Builds a handler for one step.
    #[must_use]
    pub fn handler(&self) -> Box<dyn SagaHandler> {
        (self.factory)()
    }
}

/// Registry of saga definitions built at startup.
#[derive(Debug, Default)]
pub struct SagaRegistry {
    definitions: Vec<SagaDefinition>,
    by_type: HashMap<String, Vec<usize>>,
    wildcard: Vec<usize>,
}

impl SagaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition.
    #[must_use]
    pub fn with(mut self, definition: SagaDefinition) -> Self {
        self.register(definition);
        self
    }

    /// Adds a definition.
    pub fn register(&mut self, definition: SagaDefinition) {
        let index = self.definitions.len();
        match &definition.pattern {
            MessagePattern::Any => self.wildcard.push(index),
            MessagePattern::Types(types) => {
                for message_type in types {
                    self.by_type.entry(message_type.clone()).or_default().push(index);
                }
            }
        }
        tracing::debug!(saga = %definition.name, queue = %definition.queue, "saga definition registered");
        self.definitions.push(definition);
    }

    /// Number of registered definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Definitions `message` is addressed to, in registration order.
    #[must_use]
    pub fn matching(&self, message: &Message) -> Vec<&SagaDefinition> {
        let mut indices: Vec<usize> = self
            .by_type
            .get(&message.message_type)
            .into_iter()
            .flatten()
            .chain(&self.wildcard)
            .copied()
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
            .into_iter()
            .map(|index| &self.definitions[index])
            .filter(|definition| definition.matches(message))
            .collect()
    }
}
