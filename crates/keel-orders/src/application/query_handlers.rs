//! Query handlers for the orders context.
//!
//! Queries load aggregates through the same repositories as commands. A
//! query leaves the aggregate untouched, so committing its transaction
//! writes nothing.

use keel_core::aggregate::AggregateId;
use keel_core::error::DomainError;
use keel_core::lifecycle::LifecyclePhase;
use keel_core::manager::Context;
use keel_core::message::Message;
use keel_core::repository::Repository;
use serde::Serialize;

use crate::domain::aggregates::{OrderState, OrderStatus, StockItemState};
use crate::domain::events::OrderLine;

/// Read-only view of an order.
#[derive(Debug, Serialize)]
pub struct OrderView {
    /// The order identifier.
    pub order_id: AggregateId,
    /// The ordering customer.
    pub customer: String,
    /// Ordered lines.
    pub lines: Vec<OrderLine>,
    /// Current status.
    pub status: OrderStatus,
    /// Order total in cents.
    pub total_cents: i64,
    /// Lifecycle phase.
    pub phase: LifecyclePhase,
    /// Current version.
    pub version: i64,
}

/// Read-only view of a stock item.
#[derive(Debug, Serialize)]
pub struct StockItemView {
    /// Stock keeping unit.
    pub sku: String,
    /// Units not reserved.
    pub available: u32,
    /// Units reserved across all orders.
    pub reserved: u32,
}

/// Retrieves an order by its aggregate ID.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` if no order is stored under the
/// ID, or `DomainError::NoActiveTransaction` outside a transaction.
pub async fn get_order_by_id(
    ctx: &Context,
    order_id: &AggregateId,
    orders: &Repository<OrderState>,
) -> Result<OrderView, DomainError> {
    let handle = orders.load(ctx, order_id).await?;
    let order = handle.lock();
    let total_cents = order.state().total_cents()?;
    Ok(OrderView {
        order_id: order.id().clone(),
        customer: order.state().customer.clone(),
        lines: order.state().lines.clone(),
        status: order.state().status,
        total_cents,
        phase: order.phase(),
        version: order.version(),
    })
}

/// Retrieves a stock item by SKU.
///
/// # Errors
///
/// Returns `DomainError::AggregateNotFound` for an unknown SKU, or
/// `DomainError::NoActiveTransaction` outside a transaction.
pub async fn get_stock_item(
    ctx: &Context,
    sku: &str,
    stock: &Repository<StockItemState>,
) -> Result<StockItemView, DomainError> {
    let handle = stock.load(ctx, &AggregateId::from(sku)).await?;
    let item = handle.lock();
    Ok(StockItemView {
        sku: item.state().sku.clone(),
        available: item.state().available,
        reserved: item.state().reserved(),
    })
}

/// Committed message history of an order, in sequence order.
///
/// # Errors
///
/// Returns a store error.
pub async fn get_order_history(
    order_id: &AggregateId,
    orders: &Repository<OrderState>,
) -> Result<Vec<Message>, DomainError> {
    orders.history(order_id).await
}
