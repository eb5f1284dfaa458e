//! Command handlers for the orders context.
//!
//! Handlers run inside the caller's transaction: they load or add
//! aggregates through a repository bound to the context, mutate them, and
//! leave persistence and publication to the unit of work at commit.

use std::collections::BTreeMap;

use keel_core::aggregate::{Aggregate, AggregateHandle, AggregateId, AggregateState};
use keel_core::clock::Clock;
use keel_core::command::Command;
use keel_core::error::DomainError;
use keel_core::manager::Context;
use keel_core::message::{Message, MessageDraft};
use keel_core::repository::Repository;
use serde_json::json;
use uuid::Uuid;

use crate::application::fulfilment::FULFILMENT_QUEUE;
use crate::domain::aggregates::{OrderState, StockItemState};
use crate::domain::commands::{CancelOrder, ConfirmOrder, PlaceOrder, ReceiveStock, ReserveStock};
use crate::domain::events::OrderLine;

/// Result of a successfully handled command.
#[derive(Debug)]
pub struct OrderCommandResult {
    /// The aggregate affected or created by the command.
    pub aggregate_id: AggregateId,
    /// Aggregate version after the command.
    pub version: i64,
    /// Messages emitted so far within the transaction, not yet committed.
    pub pending_messages: Vec<Message>,
}

fn result_of<S: AggregateState>(handle: &AggregateHandle<S>) -> OrderCommandResult {
    let aggregate = handle.lock();
    OrderCommandResult {
        aggregate_id: aggregate.id().clone(),
        version: aggregate.version(),
        pending_messages: aggregate.pending_messages().to_vec(),
    }
}

/// Routes order messages to the fulfilment saga of that order.
fn to_fulfilment(drafts: Vec<MessageDraft>, order_id: &AggregateId, correlation_id: Uuid) -> Vec<MessageDraft> {
    drafts
        .into_iter()
        .map(|draft| {
            draft
                .routed_to(FULFILMENT_QUEUE, order_id.as_str())
                .correlated(correlation_id)
        })
        .collect()
}

fn correlated(drafts: Vec<MessageDraft>, correlation_id: Uuid) -> Vec<MessageDraft> {
    drafts
        .into_iter()
        .map(|draft| draft.correlated(correlation_id))
        .collect()
}

/// Handles the `PlaceOrder` command: creates and enables an order, places
/// it, and routes the result to a new fulfilment saga keyed by the order ID.
///
/// # Errors
///
/// Returns `DomainError::Validation` for an invalid order, or
/// `DomainError::NoActiveTransaction` outside a transaction.
pub async fn handle_place_order(
    ctx: &Context,
    command: &PlaceOrder,
    clock: &dyn Clock,
    orders: &Repository<OrderState>,
) -> Result<OrderCommandResult, DomainError> {
    let order_id = AggregateId::generate();
    let handle = orders.add(ctx, Aggregate::with_id(order_id.clone())).await?;
    {
        let mut order = handle.lock();
        order.enable(json!({ "customer": command.customer }), clock);
        order.mutate(clock, |state| {
            let drafts = state.place(&command.customer, command.lines.clone())?;
            Ok(to_fulfilment(drafts, &order_id, command.correlation_id))
        })?;
    }
    tracing::info!(
        command = command.command_type(),
        %order_id,
        correlation_id = %command.correlation_id,
        "order placed"
    );
    Ok(result_of(&handle))
}

/// Handles the `ConfirmOrder` command.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` for an unknown order, or
/// `DomainError::Validation` unless the order is placed.
pub async fn handle_confirm_order(
    ctx: &Context,
    command: &ConfirmOrder,
    clock: &dyn Clock,
    orders: &Repository<OrderState>,
) -> Result<OrderCommandResult, DomainError> {
    let handle = orders.load(ctx, &command.order_id).await?;
    handle.lock().mutate(clock, |state| {
        Ok(to_fulfilment(state.confirm()?, &command.order_id, command.correlation_id))
    })?;
    tracing::info!(command = command.command_type(), order_id = %command.order_id, "order confirmed");
    Ok(result_of(&handle))
}

/// Handles the `CancelOrder` command: cancels the order and destroys the
/// aggregate so no further operation is accepted.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` for an unknown order,
/// `DomainError::AggregateDestroyed` or `DomainError::Validation` if it is
/// already cancelled.
pub async fn handle_cancel_order(
    ctx: &Context,
    command: &CancelOrder,
    clock: &dyn Clock,
    orders: &Repository<OrderState>,
) -> Result<OrderCommandResult, DomainError> {
    let handle = orders.load(ctx, &command.order_id).await?;
    {
        let mut order = handle.lock();
        order.mutate(clock, |state| {
            Ok(to_fulfilment(
                state.cancel(&command.reason)?,
                &command.order_id,
                command.correlation_id,
            ))
        })?;
        order.destroy(json!({ "reason": command.reason }), clock);
    }
    tracing::info!(
        command = command.command_type(),
        order_id = %command.order_id,
        reason = %command.reason,
        "order cancelled"
    );
    Ok(result_of(&handle))
}

/// Handles the `ReceiveStock` command, creating the stock item on first
/// receipt.
///
/// # Errors
///
/// Returns `DomainError::Validation` for a zero quantity, or a store error.
pub async fn handle_receive_stock(
    ctx: &Context,
    command: &ReceiveStock,
    clock: &dyn Clock,
    stock: &Repository<StockItemState>,
) -> Result<OrderCommandResult, DomainError> {
    let sku = AggregateId::from(command.sku.as_str());
    let handle = match stock.load(ctx, &sku).await {
        Ok(handle) => handle,
        Err(DomainError::AggregateNotFound(_)) => {
            let handle = stock.add(ctx, Aggregate::with_id(sku.clone())).await?;
            handle.lock().enable(json!({ "sku": command.sku }), clock);
            handle
        }
        Err(err) => return Err(err),
    };
    handle.lock().mutate(clock, |state| {
        Ok(correlated(
            state.receive(&command.sku, command.quantity)?,
            command.correlation_id,
        ))
    })?;
    tracing::info!(command = command.command_type(), %sku, quantity = command.quantity, "stock received");
    Ok(result_of(&handle))
}

/// Sums the ordered quantity per SKU. Iterating the map visits SKUs in
/// sorted order, which is the order stock rows are locked in.
fn quantities_by_sku(lines: &[OrderLine]) -> Result<BTreeMap<&str, u32>, DomainError> {
    let mut quantities = BTreeMap::new();
    for line in lines {
        let total: &mut u32 = quantities.entry(line.sku.as_str()).or_default();
        *total = total.checked_add(line.quantity).ok_or_else(|| {
            DomainError::Validation(format!("quantity for {} overflows", line.sku))
        })?;
    }
    Ok(quantities)
}

/// Handles the `ReserveStock` command: reserves every SKU or fails, in
/// which case the caller rolls the transaction back and nothing is held.
/// Lines for the same SKU are reserved together.
///
/// # Errors
///
/// Returns `DomainError::Validation` for an unknown SKU or insufficient
/// stock.
pub async fn handle_reserve_stock(
    ctx: &Context,
    command: &ReserveStock,
    clock: &dyn Clock,
    stock: &Repository<StockItemState>,
) -> Result<Vec<OrderCommandResult>, DomainError> {
    let quantities = quantities_by_sku(&command.lines)?;
    let mut results = Vec::with_capacity(quantities.len());
    for (sku, quantity) in &quantities {
        let id = AggregateId::from(*sku);
        let handle = stock.load(ctx, &id).await.map_err(|err| match err {
            DomainError::AggregateNotFound(_) => DomainError::Validation(format!("unknown sku {sku}")),
            other => other,
        })?;
        handle.lock().mutate(clock, |state| {
            Ok(correlated(
                state.reserve(command.order_id.as_str(), *quantity)?,
                command.correlation_id,
            ))
        })?;
        results.push(result_of(&handle));
    }
    tracing::info!(
        command = command.command_type(),
        order_id = %command.order_id,
        skus = quantities.len(),
        "stock reserved"
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use keel_core::error::DomainError;
    use keel_core::lifecycle::LifecyclePhase;
    use keel_core::message::LIFECYCLE_ENABLED_MESSAGE_TYPE;
    use uuid::Uuid;

    use super::*;
    use crate::application::testing::{Harness, line};
    use crate::domain::aggregates::OrderStatus;
    use crate::domain::events::{ORDER_CANCELLED_MESSAGE_TYPE, ORDER_PLACED_MESSAGE_TYPE};

    #[tokio::test]
    async fn test_handle_place_order_persists_state_and_messages_on_commit() {
        // Arrange
        let harness = Harness::new();
        let command = PlaceOrder {
            correlation_id: Uuid::new_v4(),
            customer: "ada".to_owned(),
            lines: vec![line("SKU-1", 2)],
        };
        let tx = harness.coordinator.begin();
        let ctx = Context::new(tx);

        // Act
        let result = handle_place_order(&ctx, &command, &harness.clock, &harness.orders())
            .await
            .unwrap();
        harness.coordinator.commit(tx).await.unwrap();

        // Assert
        assert_eq!(result.version, 2);
        let types: Vec<&str> = result
            .pending_messages
            .iter()
            .map(|m| m.message_type.as_str())
            .collect();
        assert_eq!(types, vec![LIFECYCLE_ENABLED_MESSAGE_TYPE, ORDER_PLACED_MESSAGE_TYPE]);

        let history = harness.orders().history(&result.aggregate_id).await.unwrap();
        assert_eq!(history.len(), 2);
        let placed = &history[1];
        assert_eq!(placed.sequence_number, 2);
        assert_eq!(placed.queue.as_deref(), Some(FULFILMENT_QUEUE));
        assert_eq!(placed.tracking_token.as_deref(), Some(result.aggregate_id.as_str()));
        assert_eq!(placed.correlation_id, Some(command.correlation_id));
        assert_eq!(placed.occurred_at, harness.clock.0);
    }

    #[tokio::test]
    async fn test_handle_place_order_rejects_empty_order_without_tracking_changes() {
        let harness = Harness::new();
        let command = PlaceOrder {
            correlation_id: Uuid::new_v4(),
            customer: "ada".to_owned(),
            lines: Vec::new(),
        };
        let tx = harness.coordinator.begin();
        let ctx = Context::new(tx);

        let result = handle_place_order(&ctx, &command, &harness.clock, &harness.orders()).await;
        harness.coordinator.rollback(tx).await.unwrap();

        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert_eq!(harness.store.row_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_cancel_order_destroys_the_order() {
        // Arrange
        let harness = Harness::new();
        let order_id = harness.place_order(vec![line("SKU-1", 1)]).await;
        let command = CancelOrder {
            correlation_id: Uuid::new_v4(),
            order_id: order_id.clone(),
            reason: "changed mind".to_owned(),
        };

        // Act
        let tx = harness.coordinator.begin();
        let ctx = Context::new(tx);
        let result = handle_cancel_order(&ctx, &command, &harness.clock, &harness.orders())
            .await
            .unwrap();
        harness.coordinator.commit(tx).await.unwrap();

        // Assert
        assert_eq!(result.pending_messages[0].message_type, ORDER_CANCELLED_MESSAGE_TYPE);
        let view = harness.order_view(&order_id).await;
        assert_eq!(view.status, OrderStatus::Cancelled);
        assert_eq!(view.phase, LifecyclePhase::Destroyed);

        let tx = harness.coordinator.begin();
        let again = handle_cancel_order(&Context::new(tx), &command, &harness.clock, &harness.orders()).await;
        harness.coordinator.rollback(tx).await.unwrap();
        assert!(matches!(again, Err(DomainError::AggregateDestroyed(_))));
    }

    #[tokio::test]
    async fn test_handle_confirm_order_returns_error_when_order_not_found() {
        let harness = Harness::new();
        let command = ConfirmOrder {
            correlation_id: Uuid::new_v4(),
            order_id: AggregateId::from("missing"),
        };
        let tx = harness.coordinator.begin();

        let result = handle_confirm_order(&Context::new(tx), &command, &harness.clock, &harness.orders()).await;
        harness.coordinator.rollback(tx).await.unwrap();

        match result {
            Err(DomainError::AggregateNotFound(id)) => assert_eq!(id, command.order_id),
            other => panic!("expected AggregateNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handle_receive_stock_creates_then_increments() {
        let harness = Harness::new();

        harness.receive_stock("SKU-1", 3).await;
        harness.receive_stock("SKU-1", 4).await;

        let tx = harness.coordinator.begin();
        let item = harness
            .stock()
            .load(&Context::new(tx), &AggregateId::from("SKU-1"))
            .await
            .unwrap();
        let (available, version) = {
            let item = item.lock();
            (item.state().available, item.version())
        };
        harness.coordinator.commit(tx).await.unwrap();
        assert_eq!(available, 7);
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn test_handle_reserve_stock_is_all_or_nothing() {
        // Arrange
        let harness = Harness::new();
        harness.receive_stock("SKU-1", 5).await;
        harness.receive_stock("SKU-2", 1).await;
        let command = ReserveStock {
            correlation_id: Uuid::new_v4(),
            order_id: AggregateId::from("o-1"),
            lines: vec![line("SKU-1", 2), line("SKU-2", 3)],
        };

        // Act
        let tx = harness.coordinator.begin();
        let ctx = Context::new(tx);
        let result = handle_reserve_stock(&ctx, &command, &harness.clock, &harness.stock()).await;
        let finished = harness.coordinator.finish(tx, result).await;

        // Assert
        assert!(matches!(finished, Err(DomainError::Validation(_))));
        let tx = harness.coordinator.begin();
        let first = harness
            .stock()
            .load(&Context::new(tx), &AggregateId::from("SKU-1"))
            .await
            .unwrap();
        let available = first.lock().state().available;
        harness.coordinator.commit(tx).await.unwrap();
        assert_eq!(available, 5);
    }

    async fn reserve(harness: &Harness, order_id: &str, lines: Vec<OrderLine>) -> Result<(), DomainError> {
        let command = ReserveStock {
            correlation_id: Uuid::new_v4(),
            order_id: AggregateId::from(order_id),
            lines,
        };
        let tx = harness.coordinator.begin();
        let result = handle_reserve_stock(&Context::new(tx), &command, &harness.clock, &harness.stock()).await;
        harness.coordinator.finish(tx, result).await.map(|_| ())
    }

    async fn stock_levels(harness: &Harness, sku: &str) -> (u32, u32, i64) {
        let tx = harness.coordinator.begin();
        let item = harness
            .stock()
            .load(&Context::new(tx), &AggregateId::from(sku))
            .await
            .unwrap();
        let levels = {
            let item = item.lock();
            (item.state().available, item.state().reserved(), item.version())
        };
        harness.coordinator.commit(tx).await.unwrap();
        levels
    }

    #[tokio::test]
    async fn test_handle_reserve_stock_sums_lines_for_the_same_sku() {
        // Arrange
        let harness = Harness::new();
        harness.receive_stock("SKU-1", 10).await;

        // Act
        reserve(&harness, "o-1", vec![line("SKU-1", 2), line("SKU-1", 3)])
            .await
            .unwrap();

        // Assert
        let (available, reserved, _) = stock_levels(&harness, "SKU-1").await;
        assert_eq!(available, 5);
        assert_eq!(reserved, 5);
    }

    #[tokio::test]
    async fn test_handle_reserve_stock_repeated_for_same_order_keeps_version() {
        let harness = Harness::new();
        harness.receive_stock("SKU-1", 10).await;
        reserve(&harness, "o-1", vec![line("SKU-1", 4)]).await.unwrap();
        let (_, _, before) = stock_levels(&harness, "SKU-1").await;

        reserve(&harness, "o-1", vec![line("SKU-1", 4)]).await.unwrap();

        let (available, reserved, after) = stock_levels(&harness, "SKU-1").await;
        assert_eq!((available, reserved), (6, 4));
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_handle_reserve_stock_locks_skus_in_a_stable_order() {
        // Arrange
        let harness = Harness::new();
        harness.receive_stock("SKU-A", 5).await;
        harness.receive_stock("SKU-B", 5).await;

        // Act
        let both = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            tokio::join!(
                reserve(&harness, "o-1", vec![line("SKU-A", 1), line("SKU-B", 1)]),
                reserve(&harness, "o-2", vec![line("SKU-B", 1), line("SKU-A", 1)]),
            )
        })
        .await;

        // Assert
        let (first, second) = both.expect("reservations should not wait on each other's locks");
        first.unwrap();
        second.unwrap();
        assert_eq!(stock_levels(&harness, "SKU-A").await.1, 2);
        assert_eq!(stock_levels(&harness, "SKU-B").await.1, 2);
    }
}
