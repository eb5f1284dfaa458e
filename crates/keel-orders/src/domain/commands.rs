//! Commands for the orders context.

use keel_core::aggregate::AggregateId;
use keel_core::command::Command;
use uuid::Uuid;

use super::events::OrderLine;

/// Command to place a new order.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The ordering customer.
    pub customer: String,
    /// Ordered lines.
    pub lines: Vec<OrderLine>,
}

impl Command for PlaceOrder {
    fn command_type(&self) -> &'static str {
        "orders.place_order"
    }

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

/// Command to confirm an order whose stock is reserved.
#[derive(Debug, Clone)]
pub struct ConfirmOrder {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The order to confirm.
    pub order_id: AggregateId,
}

impl Command for ConfirmOrder {
    fn command_type(&self) -> &'static str {
        "orders.confirm_order"
    }

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

/// Command to cancel an order.
#[derive(Debug, Clone)]
pub struct CancelOrder {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The order to cancel.
    pub order_id: AggregateId,
    /// Why the order is cancelled.
    pub reason: String,
}

impl Command for CancelOrder {
    fn command_type(&self) -> &'static str {
        "orders.cancel_order"
    }

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

/// Command to add received units to a stock item, creating it if needed.
#[derive(Debug, Clone)]
pub struct ReceiveStock {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// Stock keeping unit; also the stock item's identity.
    pub sku: String,
    /// Units received.
    pub quantity: u32,
}

impl Command for ReceiveStock {
    fn command_type(&self) -> &'static str {
        "orders.receive_stock"
    }

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}

/// Command to reserve stock for every line of an order, all or nothing.
#[derive(Debug, Clone)]
pub struct ReserveStock {
    /// The correlation ID for tracing.
    pub correlation_id: Uuid,
    /// The order the units are held for.
    pub order_id: AggregateId,
    /// Lines to reserve.
    pub lines: Vec<OrderLine>,
}

impl Command for ReserveStock {
    fn command_type(&self) -> &'static str {
        "orders.reserve_stock"
    }

    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
}
