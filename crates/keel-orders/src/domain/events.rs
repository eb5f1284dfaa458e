//! Message payloads for the orders context.

use keel_core::error::DomainError;
use serde::{Deserialize, Serialize};

/// A line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Stock keeping unit.
    pub sku: String,
    /// Units ordered.
    pub quantity: u32,
    /// Price per unit in cents.
    pub unit_price_cents: i64,
}

impl OrderLine {
    /// Line total in cents.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the total overflows.
    pub fn total_cents(&self) -> Result<i64, DomainError> {
        self.unit_price_cents
            .checked_mul(i64::from(self.quantity))
            .ok_or_else(|| DomainError::Validation(format!("line total for {} overflows", self.sku)))
    }
}

/// Emitted when an order is placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    /// The ordering customer.
    pub customer: String,
    /// Ordered lines.
    pub lines: Vec<OrderLine>,
    /// Order total in cents.
    pub total_cents: i64,
}

/// Emitted when stock for every line has been reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    /// Order total in cents.
    pub total_cents: i64,
}

/// Emitted when an order is cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    /// Why the order was cancelled.
    pub reason: String,
}

/// Emitted when stock arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReceived {
    /// Stock keeping unit.
    pub sku: String,
    /// Units received.
    pub quantity: u32,
    /// Units available after receipt.
    pub available: u32,
}

/// Emitted when units are reserved for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    /// Stock keeping unit.
    pub sku: String,
    /// The order the units are held for.
    pub order_id: String,
    /// Units reserved.
    pub quantity: u32,
}

/// Emitted when a reservation is given back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReleased {
    /// Stock keeping unit.
    pub sku: String,
    /// The order the units were held for.
    pub order_id: String,
    /// Units released.
    pub quantity: u32,
}

/// Message type of [`OrderPlaced`].
pub const ORDER_PLACED_MESSAGE_TYPE: &str = "order.placed";

/// Message type of [`OrderConfirmed`].
pub const ORDER_CONFIRMED_MESSAGE_TYPE: &str = "order.confirmed";

/// Message type of [`OrderCancelled`].
pub const ORDER_CANCELLED_MESSAGE_TYPE: &str = "order.cancelled";

/// Message type of [`StockReceived`].
pub const STOCK_RECEIVED_MESSAGE_TYPE: &str = "stock.received";

/// Message type of [`StockReserved`].
pub const STOCK_RESERVED_MESSAGE_TYPE: &str = "stock.reserved";

/// Message type of [`StockReleased`].
pub const STOCK_RELEASED_MESSAGE_TYPE: &str = "stock.released";
