//! Integration tests for `PgAggregateStore`.
//!
//! These need a reachable `PostgreSQL` server via `DATABASE_URL`.

use chrono::{TimeZone, Utc};
use keel_core::aggregate::AggregateId;
use keel_core::error::DomainError;
use keel_core::lifecycle::LifecyclePhase;
use keel_core::message::{MessageDraft, MessageOrigin};
use keel_core::repository::{AggregateStore, StoredAggregate};
use keel_core::transaction::{TransactionId, TransactionalResource};
use keel_store::pg::PgAggregateStore;
use serde_json::json;
use sqlx::PgPool;

fn make_record(id: &AggregateId, version: i64, sequence: i64) -> StoredAggregate {
    StoredAggregate {
        aggregate_type: "order".to_owned(),
        aggregate_id: id.clone(),
        version,
        sequence,
        phase: LifecyclePhase::Enabled,
        state: json!({ "lines": version }),
    }
}

fn make_message(id: &AggregateId, sequence_number: i64) -> keel_core::message::Message {
    MessageDraft::from_value("order.line_added", json!({ "n": sequence_number }))
        .routed_to("fulfilment", "T1")
        .into_message(
            MessageOrigin {
                aggregate_type: "order".to_owned(),
                aggregate_id: id.clone(),
                aggregate_version: sequence_number,
                sequence_number,
                phase: LifecyclePhase::Enabled,
            },
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        )
}

// --- save + load ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn test_load_returns_none_for_missing_aggregate(pool: PgPool) {
    let store = PgAggregateStore::new(pool);
    let transaction = TransactionId::new();

    let loaded = store
        .load(transaction, "order", &AggregateId::generate())
        .await
        .unwrap();

    assert!(loaded.is_none());
    store.rollback(transaction).await;
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn test_saved_record_round_trips_after_commit(pool: PgPool) {
    // Arrange
    let store = PgAggregateStore::new(pool);
    let id = AggregateId::generate();
    let record = make_record(&id, 5, 5);
    let writer = TransactionId::new();

    // Act
    store.save(writer, &record, None).await.unwrap();
    store.commit(writer).await.unwrap();
    let reader = TransactionId::new();
    let loaded = store.load(reader, "order", &id).await.unwrap();
    store.rollback(reader).await;

    // Assert
    assert_eq!(loaded, Some(record));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn test_rolled_back_save_is_not_visible(pool: PgPool) {
    let store = PgAggregateStore::new(pool);
    let id = AggregateId::generate();
    let writer = TransactionId::new();

    store.save(writer, &make_record(&id, 1, 1), None).await.unwrap();
    store.rollback(writer).await;
    let reader = TransactionId::new();
    let loaded = store.load(reader, "order", &id).await.unwrap();
    store.rollback(reader).await;

    assert!(loaded.is_none());
}

// --- optimistic check ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn test_stale_expected_version_is_rejected(pool: PgPool) {
    let store = PgAggregateStore::new(pool);
    let id = AggregateId::generate();
    let setup = TransactionId::new();
    store.save(setup, &make_record(&id, 3, 3), None).await.unwrap();
    store.commit(setup).await.unwrap();
    let winner = TransactionId::new();
    store
        .save(winner, &make_record(&id, 4, 4), Some(3))
        .await
        .unwrap();
    store.commit(winner).await.unwrap();

    let loser = TransactionId::new();
    let result = store.save(loser, &make_record(&id, 4, 4), Some(3)).await;
    store.rollback(loser).await;

    match result {
        Err(DomainError::ConcurrentModification {
            expected, actual, ..
        }) => {
            assert_eq!(expected, Some(3));
            assert_eq!(actual, Some(4));
        }
        other => panic!("expected ConcurrentModification, got {other:?}"),
    }
}

// --- messages ---

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn test_messages_load_in_sequence_order(pool: PgPool) {
    let store = PgAggregateStore::new(pool);
    let id = AggregateId::generate();
    let messages = vec![make_message(&id, 2), make_message(&id, 1)];
    let transaction = TransactionId::new();

    store.append_messages(transaction, &messages).await.unwrap();
    store.commit(transaction).await.unwrap();
    let loaded = store.load_messages("order", &id).await.unwrap();

    let sequence: Vec<i64> = loaded.iter().map(|m| m.sequence_number).collect();
    assert_eq!(sequence, vec![1, 2]);
    assert_eq!(loaded[0], messages[1]);
    assert_eq!(loaded[0].tracking_token.as_deref(), Some("T1"));
}

#[sqlx::test(migrations = "../../migrations")]
#[ignore = "requires a PostgreSQL DATABASE_URL"]
async fn test_duplicate_message_sequence_is_rejected(pool: PgPool) {
    let store = PgAggregateStore::new(pool);
    let id = AggregateId::generate();
    let transaction = TransactionId::new();

    let result = store
        .append_messages(transaction, &[make_message(&id, 1), make_message(&id, 1)])
        .await;
    store.rollback(transaction).await;

    assert!(matches!(result, Err(DomainError::Infrastructure(_))));
}
