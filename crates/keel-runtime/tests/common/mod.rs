//! Shared helpers for runtime integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::aggregate::{Aggregate, AggregateId, AggregateState, ConcurrencyPolicy};
use keel_core::clock::Clock;
use keel_core::dispatch::Publisher;
use keel_core::error::DomainError;
use keel_core::message::MessageDraft;
use keel_core::repository::AggregateStore;
use keel_core::transaction::TransactionalResource;
use keel_runtime::config::KeelConfig;
use keel_runtime::runtime::KeelRuntime;
use keel_saga::definition::SagaRegistry;
use keel_store::memory::InMemoryAggregateStore;
use keel_test_support::{FixedClock, RecordingPublisher};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const NOTE_RETITLED: &str = "note.retitled";
pub const COUNTER_INCREMENTED: &str = "counter.incremented";

/// Optimistically versioned test aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Note {
    pub title: String,
}

impl AggregateState for Note {
    const AGGREGATE_TYPE: &'static str = "note";
}

/// Row-locked test aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Counter {
    pub value: i64,
}

impl AggregateState for Counter {
    const AGGREGATE_TYPE: &'static str = "counter";
    const CONCURRENCY: ConcurrencyPolicy = ConcurrencyPolicy::Pessimistic;
}

/// Fixed timestamp used across all integration tests.
pub fn fixed_clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock::on(2026, 1, 15))
}

pub fn retitle(note: &mut Aggregate<Note>, title: &str, clock: &dyn Clock) -> Result<(), DomainError> {
    note.mutate(clock, |state| {
        title.clone_into(&mut state.title);
        Ok(vec![MessageDraft::from_value(NOTE_RETITLED, json!({ "title": title }))])
    })
}

pub fn increment(counter: &mut Aggregate<Counter>, clock: &dyn Clock) -> Result<(), DomainError> {
    counter.mutate(clock, |state| {
        state.value += 1;
        Ok(vec![MessageDraft::from_value(
            COUNTER_INCREMENTED,
            json!({ "value": state.value }),
        )])
    })
}

/// Build a runtime without sagas around `store`, publishing to `transport`.
pub fn build_runtime<S>(store: Arc<S>, transport: Arc<dyn Publisher>) -> KeelRuntime
where
    S: AggregateStore + TransactionalResource + 'static,
{
    build_runtime_with(KeelConfig::default(), store, transport)
}

pub fn build_runtime_with<S>(config: KeelConfig, store: Arc<S>, transport: Arc<dyn Publisher>) -> KeelRuntime
where
    S: AggregateStore + TransactionalResource + 'static,
{
    KeelRuntime::with_store(config, store, transport, fixed_clock(), |_| SagaRegistry::new())
}

/// Build an in-memory runtime recording everything it publishes.
pub fn memory_runtime() -> (KeelRuntime, Arc<InMemoryAggregateStore>, Arc<RecordingPublisher>) {
    let store = Arc::new(InMemoryAggregateStore::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let runtime = build_runtime(Arc::clone(&store), publisher.clone());
    (runtime, store, publisher)
}

/// Create, enable and title a note in its own transaction. The note ends at
/// version 2 with two messages.
pub async fn create_note(runtime: &KeelRuntime, id: &str, title: &str) {
    let notes = runtime.repository::<Note>();
    runtime
        .in_transaction(|ctx| async move {
            let handle = notes.add(&ctx, Aggregate::with_id(AggregateId::from(id))).await?;
            let mut note = handle.lock();
            note.enable(json!({}), runtime.clock());
            retitle(&mut note, title, runtime.clock())
        })
        .await
        .unwrap();
}

/// Retitle an existing note in its own transaction.
pub async fn retitle_committed(runtime: &KeelRuntime, id: &str, title: &str) -> Result<(), DomainError> {
    let notes = runtime.repository::<Note>();
    runtime
        .in_transaction(|ctx| async move {
            let handle = notes.load(&ctx, &AggregateId::from(id)).await?;
            let mut note = handle.lock();
            retitle(&mut note, title, runtime.clock())
        })
        .await
}

/// Load a committed note and return its `(version, sequence, title)`.
pub async fn snapshot(runtime: &KeelRuntime, id: &str) -> (i64, i64, String) {
    let notes = runtime.repository::<Note>();
    runtime
        .in_transaction(|ctx| async move {
            let handle = notes.load(&ctx, &AggregateId::from(id)).await?;
            let note = handle.lock();
            Ok((note.version(), note.sequence(), note.state().title.clone()))
        })
        .await
        .unwrap()
}

/// Poll until `condition` holds or a second has passed.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
