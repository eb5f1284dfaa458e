//! Test publishers: mock `Publisher` implementations for tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::aggregate::AggregateId;
use keel_core::dispatch::Publisher;
use keel_core::error::DomainError;
use keel_core::message::Message;

/// A publisher that records every message it is handed, optionally pausing
/// before each one.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    delay: Option<Duration>,
    published: Mutex<Vec<(Message, AggregateId)>>,
}

impl RecordingPublisher {
    /// Create a new recording publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` before recording each message.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns a snapshot of all published messages, in publication order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn published(&self) -> Vec<Message> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(message, _)| message.clone())
            .collect()
    }

    /// Returns the message types published so far, in publication order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn message_types(&self) -> Vec<String> {
        self.published()
            .into_iter()
            .map(|message| message.message_type)
            .collect()
    }

    /// Returns the ordering keys messages were published under.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn ordering_keys(&self) -> Vec<AggregateId> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, key)| key.clone())
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, message: &Message, ordering_key: &AggregateId) -> Result<(), DomainError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.published
            .lock()
            .unwrap()
            .push((message.clone(), ordering_key.clone()));
        Ok(())
    }
}

/// A publisher that fails messages of the configured types (every message
/// when none are configured) and records the rest.
#[derive(Debug, Default)]
pub struct FailingPublisher {
    failing_types: Vec<String>,
    delivered: RecordingPublisher,
    attempts: Mutex<usize>,
}

impl FailingPublisher {
    /// Create a publisher that fails every message.
    #[must_use]
    pub fn always() -> Self {
        Self::default()
    }

    /// Create a publisher that fails only messages of `message_type`.
    #[must_use]
    pub fn for_type(message_type: impl Into<String>) -> Self {
        Self {
            failing_types: vec![message_type.into()],
            ..Self::default()
        }
    }

    /// Number of publish attempts, successful or not.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    /// Messages that were not failed.
    pub fn delivered(&self) -> Vec<Message> {
        self.delivered.published()
    }
}

#[async_trait]
impl Publisher for FailingPublisher {
    async fn publish(&self, message: &Message, ordering_key: &AggregateId) -> Result<(), DomainError> {
        *self.attempts.lock().unwrap() += 1;
        let fails = self.failing_types.is_empty()
            || self.failing_types.iter().any(|t| *t == message.message_type);
        if fails {
            return Err(DomainError::PublicationFailure {
                message_id: message.message_id,
                reason: "transport unavailable".to_owned(),
            });
        }
        self.delivered.publish(message, ordering_key).await
    }
}
