//! Saga steps that commit work publish through the dispatcher they run on.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::aggregate::{Aggregate, AggregateId};
use keel_core::clock::Clock;
use keel_core::manager::Context;
use keel_core::message::{Message, MessageDraft};
use keel_core::repository::Repository;
use keel_core::transaction::LocalTransactionCoordinator;
use keel_runtime::config::KeelConfig;
use keel_runtime::runtime::KeelRuntime;
use keel_saga::definition::{MessagePattern, SagaDefinition, SagaHandler, SagaRegistry, SagaStepError, StepContext};
use keel_store::memory::InMemoryAggregateStore;
use keel_test_support::RecordingPublisher;
use serde_json::json;

use common::{NOTE_RETITLED, Note};

const ECHO_DONE: &str = "echo.done";

/// Answers every retitled note with a new note whose message must be
/// published before the step's transaction returns.
#[derive(Clone)]
struct EchoSaga {
    coordinator: Arc<LocalTransactionCoordinator>,
    notes: Repository<Note>,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl SagaHandler for EchoSaga {
    async fn handle(&self, step: &mut StepContext<'_>, message: &Message) -> Result<(), SagaStepError> {
        let tx = self.coordinator.begin();
        let ctx = Context::new(tx);
        let echo_id = AggregateId::from(format!("echo-{}", message.aggregate_id).as_str());
        let result = async {
            let handle = self.notes.add(&ctx, Aggregate::with_id(echo_id)).await?;
            handle.lock().mutate(self.clock.as_ref(), |_| {
                Ok(vec![MessageDraft::from_value(ECHO_DONE, json!({})).effect_immediately()])
            })
        }
        .await;
        self.coordinator.finish(tx, result).await?;
        step.complete();
        Ok(())
    }
}

fn echo_runtime(publisher: Arc<RecordingPublisher>) -> KeelRuntime {
    let config = KeelConfig {
        dispatch_shards: 1,
        ..KeelConfig::default()
    };
    KeelRuntime::with_store(
        config,
        Arc::new(InMemoryAggregateStore::new()),
        publisher,
        common::fixed_clock(),
        |wiring| {
            let echo = EchoSaga {
                coordinator: Arc::clone(wiring.coordinator),
                notes: Repository::new(Arc::clone(wiring.manager)),
                clock: Arc::clone(wiring.clock),
            };
            let pattern = MessagePattern::Types(vec![NOTE_RETITLED.to_owned()]);
            SagaRegistry::new()
                .with(SagaDefinition::new("echo", "echo", pattern, move || echo.clone()).initiated_by(NOTE_RETITLED))
        },
    )
}

#[tokio::test]
async fn test_saga_step_committing_immediate_message_does_not_stall_dispatcher() {
    // Arrange
    let publisher = Arc::new(RecordingPublisher::new());
    let runtime = echo_runtime(publisher.clone());

    // Act
    common::create_note(&runtime, "n-1", "hello").await;
    let delivered = common::eventually(|| publisher.message_types().iter().any(|t| t == ECHO_DONE)).await;
    let stopped = tokio::time::timeout(Duration::from_secs(2), runtime.shutdown()).await;

    // Assert
    assert!(delivered, "echo.done was not published");
    assert!(stopped.is_ok(), "dispatcher did not drain");
    let echo = runtime
        .repository::<Note>()
        .history(&AggregateId::from("echo-n-1"))
        .await
        .unwrap();
    assert_eq!(echo.len(), 1);
    assert_eq!(echo[0].message_type, ECHO_DONE);
}
