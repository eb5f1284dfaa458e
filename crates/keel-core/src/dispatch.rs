//! Post-commit message publication.
//!
//! The [`MessageDispatcher`] owns a fixed number of FIFO worker tasks and
//! routes every message to the worker chosen by its ordering key, so messages
//! of one aggregate are always published in the order they were handed over.
//! Ordering across aggregates is not preserved.
//!
//! Publishers run on the workers, and a publisher may itself commit work
//! whose messages come back to the dispatcher. Code running on a worker
//! therefore never waits on a worker: [`MessageDispatcher::dispatch_and_wait`]
//! publishes inline there.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::aggregate::AggregateId;
use crate::error::DomainError;
use crate::message::Message;

/// Transport that committed messages are handed to.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `message`. Delivery guarantees beyond a single attempt are
    /// the transport's concern.
    async fn publish(&self, message: &Message, ordering_key: &AggregateId)
    -> Result<(), DomainError>;
}

/// Publishes every message to each of several publishers in turn.
///
/// A failing publisher does not stop the others; the first error is
/// returned. Publishers may be attached while the composite is in use, which
/// lets consumers that depend on the dispatcher subscribe after it started.
#[derive(Default)]
pub struct CompositePublisher {
    publishers: RwLock<Vec<Arc<dyn Publisher>>>,
}

impl CompositePublisher {
    /// Creates an empty composite.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a publisher.
    #[must_use]
    pub fn with(self, publisher: Arc<dyn Publisher>) -> Self {
        self.attach(publisher);
        self
    }

    /// Adds a publisher to a composite that may already be in use.
    pub fn attach(&self, publisher: Arc<dyn Publisher>) {
        self.publishers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(publisher);
    }

    /// Number of attached publishers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Publisher for CompositePublisher {
    async fn publish(
        &self,
        message: &Message,
        ordering_key: &AggregateId,
    ) -> Result<(), DomainError> {
        let publishers = self
            .publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut first_error = None;
        for publisher in &publishers {
            if let Err(err) = publisher.publish(message, ordering_key).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

tokio::task_local! {
    /// The dispatcher whose worker is running the current task.
    static WORKER_OF: Uuid;
}

struct Envelope {
    message: Message,
    ack: Option<oneshot::Sender<Result<(), DomainError>>>,
}

/// Sharded asynchronous publication channel.
pub struct MessageDispatcher {
    id: Uuid,
    publisher: Arc<dyn Publisher>,
    shard_count: usize,
    shards: Mutex<Option<Vec<mpsc::UnboundedSender<Envelope>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("shard_count", &self.shard_count)
            .finish_non_exhaustive()
    }
}

impl MessageDispatcher {
    /// Spawns `shard_count` workers (at least one) publishing to `publisher`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(publisher: Arc<dyn Publisher>, shard_count: usize) -> Self {
        let id = Uuid::now_v7();
        let shard_count = shard_count.max(1);
        let mut senders = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            let worker = WORKER_OF.scope(id, run_shard(shard, Arc::clone(&publisher), rx));
            workers.push(tokio::spawn(worker));
        }
        Self {
            id,
            publisher,
            shard_count,
            shards: Mutex::new(Some(senders)),
            workers: Mutex::new(workers),
        }
    }

    /// Number of worker shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shard_for(&self, key: &AggregateId) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shard_count as u64) as usize
    }

    fn enqueue(&self, envelope: Envelope) -> Result<(), DomainError> {
        let shard = self.shard_for(envelope.message.ordering_key());
        let shards = self.shards.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(senders) = shards.as_ref() else {
            return Err(DomainError::PublicationFailure {
                message_id: envelope.message.message_id,
                reason: "dispatcher is shut down".to_owned(),
            });
        };
        senders[shard].send(envelope).map_err(|rejected| DomainError::PublicationFailure {
            message_id: rejected.0.message.message_id,
            reason: "dispatcher worker stopped".to_owned(),
        })
    }

    /// Queues `message` for publication and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::PublicationFailure` if the dispatcher is shut
    /// down.
    pub fn dispatch(&self, message: Message) -> Result<(), DomainError> {
        self.enqueue(Envelope { message, ack: None })
    }

    /// Returns `true` when called from a task running on one of this
    /// dispatcher's workers.
    #[must_use]
    pub fn on_worker(&self) -> bool {
        WORKER_OF.try_with(|id| *id == self.id).unwrap_or(false)
    }

    /// Publishes `message` on the calling task, bypassing the queues.
    ///
    /// # Errors
    ///
    /// Returns the publisher's error.
    pub async fn publish_inline(&self, message: &Message) -> Result<(), DomainError> {
        self.publisher.publish(message, message.ordering_key()).await
    }

    /// Queues `message` behind everything already queued for its aggregate
    /// and waits until it has been published. Called from one of this
    /// dispatcher's workers, it publishes inline instead, since waiting on a
    /// worker from a worker can deadlock.
    ///
    /// # Errors
    ///
    /// Returns the publisher's error, or `DomainError::PublicationFailure`
    /// if the dispatcher is shut down.
    pub async fn dispatch_and_wait(&self, message: Message) -> Result<(), DomainError> {
        if self.on_worker() {
            return self.publish_inline(&message).await;
        }
        let message_id = message.message_id;
        let (ack, done) = oneshot::channel();
        self.enqueue(Envelope {
            message,
            ack: Some(ack),
        })?;
        done.await.unwrap_or_else(|_| {
            Err(DomainError::PublicationFailure {
                message_id,
                reason: "dispatcher worker dropped the message".to_owned(),
            })
        })
    }

    /// Stops accepting messages and waits until everything queued has been
    /// published.
    pub async fn shutdown(&self) {
        drop(
            self.shards
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "dispatcher worker panicked");
            }
        }
    }
}

async fn run_shard(
    shard: usize,
    publisher: Arc<dyn Publisher>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(Envelope { message, ack }) = rx.recv().await {
        let result = publisher.publish(&message, message.ordering_key()).await;
        if let Err(err) = &result {
            tracing::error!(
                shard,
                message_id = %message.message_id,
                aggregate_id = %message.aggregate_id,
                sequence = message.sequence_number,
                error = %err,
                "message publication failed"
            );
        }
        if let Some(ack) = ack {
            // The waiter may have gone away; the outcome is already logged.
            let _ = ack.send(result);
        }
    }
    tracing::debug!(shard, "dispatcher shard drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecyclePhase;
    use crate::message::{MessageDraft, MessageOrigin};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct SlowRecorder {
        seen: Mutex<Vec<(AggregateId, i64)>>,
    }

    #[async_trait]
    impl Publisher for SlowRecorder {
        async fn publish(
            &self,
            message: &Message,
            ordering_key: &AggregateId,
        ) -> Result<(), DomainError> {
            // Earlier sequence numbers sleep longer, so reordering would show.
            let delay = u64::try_from(10 - message.sequence_number).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.seen
                .lock()
                .unwrap()
                .push((ordering_key.clone(), message.sequence_number));
            Ok(())
        }
    }

    struct Rejecting;

    #[async_trait]
    impl Publisher for Rejecting {
        async fn publish(
            &self,
            message: &Message,
            _ordering_key: &AggregateId,
        ) -> Result<(), DomainError> {
            Err(DomainError::PublicationFailure {
                message_id: message.message_id,
                reason: "broker unavailable".into(),
            })
        }
    }

    fn message(aggregate: &str, sequence: i64) -> Message {
        MessageDraft::from_value("test.happened", json!({})).into_message(
            MessageOrigin {
                aggregate_type: "test".to_owned(),
                aggregate_id: AggregateId::from(aggregate),
                aggregate_version: sequence,
                sequence_number: sequence,
                phase: LifecyclePhase::Enabled,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_per_aggregate_order_is_preserved() {
        // Arrange
        let recorder = Arc::new(SlowRecorder::default());
        let dispatcher = MessageDispatcher::spawn(recorder.clone(), 3);

        // Act
        for sequence in 1..=5 {
            dispatcher.dispatch(message("a", sequence)).unwrap();
            dispatcher.dispatch(message("b", sequence)).unwrap();
        }
        dispatcher.shutdown().await;

        // Assert
        let seen = recorder.seen.lock().unwrap().clone();
        for aggregate in ["a", "b"] {
            let sequences: Vec<i64> = seen
                .iter()
                .filter(|(key, _)| key.as_str() == aggregate)
                .map(|(_, sequence)| *sequence)
                .collect();
            assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        }
    }

    #[tokio::test]
    async fn test_dispatch_and_wait_waits_for_earlier_messages() {
        let recorder = Arc::new(SlowRecorder::default());
        let dispatcher = MessageDispatcher::spawn(recorder.clone(), 2);
        dispatcher.dispatch(message("a", 1)).unwrap();

        dispatcher.dispatch_and_wait(message("a", 2)).await.unwrap();

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(AggregateId::from("a"), 1), (AggregateId::from("a"), 2)]
        );
    }

    /// Publishes a follow-up for every `test.happened` message and waits for
    /// it, the way a consumer committing immediate messages does.
    #[derive(Default)]
    struct Echo {
        dispatcher: std::sync::OnceLock<std::sync::Weak<MessageDispatcher>>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Publisher for Echo {
        async fn publish(
            &self,
            message: &Message,
            _ordering_key: &AggregateId,
        ) -> Result<(), DomainError> {
            self.seen.lock().unwrap().push(message.message_type.clone());
            if message.message_type != "test.happened" {
                return Ok(());
            }
            let dispatcher = self.dispatcher.get().and_then(std::sync::Weak::upgrade).unwrap();
            assert!(dispatcher.on_worker());
            let mut echo = message.clone();
            echo.message_type = "test.echoed".to_owned();
            dispatcher.dispatch_and_wait(echo).await
        }
    }

    #[tokio::test]
    async fn test_dispatch_and_wait_from_a_worker_publishes_inline() {
        // Arrange
        let echo = Arc::new(Echo::default());
        let dispatcher = Arc::new(MessageDispatcher::spawn(echo.clone(), 1));
        echo.dispatcher.set(Arc::downgrade(&dispatcher)).unwrap();

        // Act
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.dispatch_and_wait(message("a", 1)),
        )
        .await;

        // Assert
        result.expect("worker must not wait on itself").unwrap();
        assert!(!dispatcher.on_worker());
        assert_eq!(
            echo.seen.lock().unwrap().clone(),
            vec!["test.happened".to_owned(), "test.echoed".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_dispatch_and_wait_reports_publisher_error() {
        let dispatcher = MessageDispatcher::spawn(Arc::new(Rejecting), 1);

        let result = dispatcher.dispatch_and_wait(message("a", 1)).await;

        assert!(matches!(result, Err(DomainError::PublicationFailure { .. })));
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_fails() {
        let dispatcher = MessageDispatcher::spawn(Arc::new(SlowRecorder::default()), 1);
        dispatcher.shutdown().await;

        let result = dispatcher.dispatch(message("a", 1));

        assert!(matches!(result, Err(DomainError::PublicationFailure { .. })));
    }

    #[tokio::test]
    async fn test_composite_publishes_to_all_and_returns_first_error() {
        let recorder = Arc::new(SlowRecorder::default());
        let composite = CompositePublisher::new()
            .with(Arc::new(Rejecting))
            .with(recorder.clone());
        let message = message("a", 1);

        let result = composite.publish(&message, message.ordering_key()).await;
        let late = Arc::new(SlowRecorder::default());
        composite.attach(late.clone());
        composite
            .publish(&message, message.ordering_key())
            .await
            .unwrap_err();

        assert!(result.is_err());
        assert_eq!(composite.len(), 3);
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
        assert_eq!(late.seen.lock().unwrap().len(), 1);
    }
}
