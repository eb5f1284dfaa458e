//! End-to-end tests: committed order messages drive the fulfilment saga.

mod common;

use std::sync::Arc;
use std::time::Duration;

use keel_core::aggregate::AggregateId;
use keel_core::lifecycle::LifecyclePhase;
use keel_orders::application::command_handlers::{handle_place_order, handle_receive_stock};
use keel_orders::application::fulfilment::{
    FULFILMENT_COMPENSATE_MESSAGE_TYPE, FULFILMENT_QUEUE, FulfilmentOutcome, FulfilmentProgress,
    FulfilmentSaga,
};
use keel_orders::application::query_handlers::{get_order_by_id, get_stock_item};
use keel_orders::domain::aggregates::{OrderState, OrderStatus, StockItemState};
use keel_orders::domain::commands::{PlaceOrder, ReceiveStock};
use keel_orders::domain::events::{ORDER_PLACED_MESSAGE_TYPE, OrderLine};
use keel_runtime::config::KeelConfig;
use keel_runtime::runtime::KeelRuntime;
use keel_saga::definition::SagaRegistry;
use keel_saga::manager::SAGA_AGGREGATE_TYPE;
use keel_saga::saga::{Saga, SagaKey};
use keel_store::memory::InMemoryAggregateStore;
use keel_test_support::RecordingPublisher;
use uuid::Uuid;

fn fulfilment_runtime() -> (KeelRuntime, Arc<RecordingPublisher>) {
    let publisher = Arc::new(RecordingPublisher::new());
    let runtime = KeelRuntime::with_store(
        KeelConfig::default(),
        Arc::new(InMemoryAggregateStore::new()),
        publisher.clone(),
        common::fixed_clock(),
        |wiring| {
            let fulfilment = FulfilmentSaga::new(
                Arc::clone(wiring.coordinator),
                Arc::clone(wiring.manager),
                Arc::clone(wiring.clock),
            );
            SagaRegistry::new().with(fulfilment.definition())
        },
    );
    (runtime, publisher)
}

async fn receive(runtime: &KeelRuntime, sku: &str, quantity: u32) {
    let command = ReceiveStock {
        correlation_id: Uuid::now_v7(),
        sku: sku.to_owned(),
        quantity,
    };
    let stock = runtime.repository::<StockItemState>();
    runtime
        .in_transaction(|ctx| async move { handle_receive_stock(&ctx, &command, runtime.clock(), &stock).await })
        .await
        .unwrap();
}

async fn place(runtime: &KeelRuntime, sku: &str, quantity: u32) -> AggregateId {
    let command = PlaceOrder {
        correlation_id: Uuid::now_v7(),
        customer: "ada".to_owned(),
        lines: vec![OrderLine {
            sku: sku.to_owned(),
            quantity,
            unit_price_cents: 400,
        }],
    };
    let orders = runtime.repository::<OrderState>();
    runtime
        .in_transaction(|ctx| async move { handle_place_order(&ctx, &command, runtime.clock(), &orders).await })
        .await
        .unwrap()
        .aggregate_id
}

async fn completed_saga(runtime: &KeelRuntime, order_id: &AggregateId) -> Saga {
    let key = SagaKey::new(FULFILMENT_QUEUE, order_id.as_str());
    for _ in 0..200 {
        if let Some(saga) = runtime.sagas().find(&key).await.unwrap() {
            if saga.is_completed() {
                return saga;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("saga {key} did not complete");
}

async fn order_status(runtime: &KeelRuntime, order_id: &AggregateId) -> (OrderStatus, LifecyclePhase) {
    let orders = runtime.repository::<OrderState>();
    let view = runtime
        .in_transaction(|ctx| async move { get_order_by_id(&ctx, order_id, &orders).await })
        .await
        .unwrap();
    (view.status, view.phase)
}

#[tokio::test]
async fn test_order_with_enough_stock_is_confirmed_and_saga_completes() {
    // Arrange
    let (runtime, _) = fulfilment_runtime();
    receive(&runtime, "ROPE", 3).await;

    // Act
    let order_id = place(&runtime, "ROPE", 2).await;
    let saga = completed_saga(&runtime, &order_id).await;

    // Assert
    let progress: FulfilmentProgress = serde_json::from_value(saga.state().clone()).unwrap();
    assert!(progress.reserved);
    assert_eq!(progress.outcome, Some(FulfilmentOutcome::Confirmed));
    assert!(saga.failures().is_empty());
    assert_eq!(saga.step(), 2);
    assert_eq!(order_status(&runtime, &order_id).await.0, OrderStatus::Confirmed);

    let stock = runtime.repository::<StockItemState>();
    let item = runtime
        .in_transaction(|ctx| async move { get_stock_item(&ctx, "ROPE", &stock).await })
        .await
        .unwrap();
    assert_eq!(item.available, 1);
    assert_eq!(item.reserved, 2);
}

#[tokio::test]
async fn test_order_without_enough_stock_is_compensated() {
    // Arrange
    let (runtime, publisher) = fulfilment_runtime();
    receive(&runtime, "ROPE", 1).await;

    // Act
    let order_id = place(&runtime, "ROPE", 4).await;
    let saga = completed_saga(&runtime, &order_id).await;

    // Assert
    assert_eq!(saga.failures().len(), 1);
    assert_eq!(saga.failures()[0].step, 1);
    let progress: FulfilmentProgress = serde_json::from_value(saga.state().clone()).unwrap();
    assert!(!progress.reserved);
    assert_eq!(progress.outcome, Some(FulfilmentOutcome::Cancelled));
    assert_eq!(
        order_status(&runtime, &order_id).await,
        (OrderStatus::Cancelled, LifecyclePhase::Destroyed)
    );

    let compensations: Vec<_> = publisher
        .published()
        .into_iter()
        .filter(|m| m.message_type == FULFILMENT_COMPENSATE_MESSAGE_TYPE)
        .collect();
    assert_eq!(compensations.len(), 1);
    assert_eq!(compensations[0].aggregate_type, SAGA_AGGREGATE_TYPE);
    assert_eq!(compensations[0].tracking_token.as_deref(), Some(order_id.as_str()));
}

#[tokio::test]
async fn test_redelivered_message_does_not_advance_completed_saga() {
    // Arrange
    let (runtime, _) = fulfilment_runtime();
    receive(&runtime, "ROPE", 2).await;
    let order_id = place(&runtime, "ROPE", 1).await;
    let before = completed_saga(&runtime, &order_id).await;
    let placed = runtime
        .repository::<OrderState>()
        .history(&order_id)
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.message_type == ORDER_PLACED_MESSAGE_TYPE)
        .unwrap();

    // Act
    let touched = runtime.sagas().trigger(&placed).await.unwrap();

    // Assert
    assert!(touched.is_empty());
    let after = completed_saga(&runtime, &order_id).await;
    assert_eq!(after.step(), before.step());
    assert_eq!(runtime.sagas().select(&order_id).await.unwrap().len(), 1);
}
