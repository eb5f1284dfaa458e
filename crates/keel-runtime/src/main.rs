//! Keel demo: places two orders against limited stock and lets the
//! fulfilment saga confirm one and compensate the other.

use std::sync::Arc;
use std::time::Duration;

use keel_core::aggregate::AggregateId;
use keel_core::clock::SystemClock;
use keel_core::error::DomainError;
use keel_core::repository::Repository;
use keel_orders::application::command_handlers::{handle_place_order, handle_receive_stock};
use keel_orders::application::fulfilment::{FULFILMENT_QUEUE, FulfilmentSaga};
use keel_orders::application::query_handlers::get_order_by_id;
use keel_orders::domain::aggregates::{OrderState, StockItemState};
use keel_orders::domain::commands::{PlaceOrder, ReceiveStock};
use keel_orders::domain::events::OrderLine;
use keel_runtime::config::KeelConfig;
use keel_runtime::error::RuntimeError;
use keel_runtime::runtime::KeelRuntime;
use keel_runtime::telemetry;
use keel_runtime::transport::TracingPublisher;
use keel_saga::definition::SagaRegistry;
use keel_saga::saga::{Saga, SagaKey};
use uuid::Uuid;

const SAGA_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), RuntimeError> {
    telemetry::init()?;
    let config = KeelConfig::from_env()?;
    tracing::info!(?config, "starting keel demo");

    let runtime = KeelRuntime::start(
        config,
        Arc::new(TracingPublisher),
        Arc::new(SystemClock),
        |wiring| {
            let fulfilment = FulfilmentSaga::new(
                Arc::clone(wiring.coordinator),
                Arc::clone(wiring.manager),
                Arc::clone(wiring.clock),
            );
            SagaRegistry::new().with(fulfilment.definition())
        },
    )
    .await?;

    receive_stock(&runtime, "KEEL-ROPE", 3).await?;
    let fulfilled = place_order(&runtime, "ada", "KEEL-ROPE", 2).await?;
    let short = place_order(&runtime, "grace", "KEEL-ROPE", 5).await?;

    for order_id in [&fulfilled, &short] {
        let saga = await_saga(&runtime, order_id).await?;
        let orders: Repository<OrderState> = runtime.repository();
        let view = runtime
            .in_transaction(|ctx| async move { get_order_by_id(&ctx, order_id, &orders).await })
            .await?;
        tracing::info!(
            %order_id,
            status = ?view.status,
            version = view.version,
            saga_steps = saga.step(),
            saga_failures = saga.failures().len(),
            "order settled"
        );
    }

    runtime.shutdown().await;
    Ok(())
}

async fn receive_stock(runtime: &KeelRuntime, sku: &str, quantity: u32) -> Result<(), DomainError> {
    let command = ReceiveStock {
        correlation_id: Uuid::now_v7(),
        sku: sku.to_owned(),
        quantity,
    };
    let stock: Repository<StockItemState> = runtime.repository();
    runtime
        .in_transaction(|ctx| async move {
            handle_receive_stock(&ctx, &command, runtime.clock(), &stock).await
        })
        .await?;
    Ok(())
}

async fn place_order(
    runtime: &KeelRuntime,
    customer: &str,
    sku: &str,
    quantity: u32,
) -> Result<AggregateId, DomainError> {
    let command = PlaceOrder {
        correlation_id: Uuid::now_v7(),
        customer: customer.to_owned(),
        lines: vec![OrderLine {
            sku: sku.to_owned(),
            quantity,
            unit_price_cents: 1_250,
        }],
    };
    let orders: Repository<OrderState> = runtime.repository();
    let result = runtime
        .in_transaction(|ctx| async move {
            handle_place_order(&ctx, &command, runtime.clock(), &orders).await
        })
        .await?;
    Ok(result.aggregate_id)
}

/// Polls until the order's fulfilment saga completes.
async fn await_saga(runtime: &KeelRuntime, order_id: &AggregateId) -> Result<Saga, DomainError> {
    let key = SagaKey::new(FULFILMENT_QUEUE, order_id.as_str());
    let deadline = tokio::time::Instant::now() + SAGA_WAIT;
    loop {
        match runtime.sagas().find(&key).await? {
            Some(saga) if saga.is_completed() => return Ok(saga),
            _ => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DomainError::Infrastructure(format!(
                "saga {key} did not complete within {SAGA_WAIT:?}"
            )));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
