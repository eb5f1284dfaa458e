//! Aggregate state for the orders context.
//!
//! State methods validate, change the state and return the drafts of the
//! messages describing the change. They run inside `Aggregate::mutate`, so a
//! rejected operation leaves the version untouched.

use std::collections::BTreeMap;

use keel_core::aggregate::{AggregateState, ConcurrencyPolicy};
use keel_core::error::DomainError;
use keel_core::message::MessageDraft;
use serde::{Deserialize, Serialize};

use super::events::{
    ORDER_CANCELLED_MESSAGE_TYPE, ORDER_CONFIRMED_MESSAGE_TYPE, ORDER_PLACED_MESSAGE_TYPE,
    OrderCancelled, OrderConfirmed, OrderLine, OrderPlaced, STOCK_RECEIVED_MESSAGE_TYPE,
    STOCK_RELEASED_MESSAGE_TYPE, STOCK_RESERVED_MESSAGE_TYPE, StockReceived, StockReleased,
    StockReserved,
};

/// Where an order stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Not yet placed.
    #[default]
    Draft,
    /// Placed, awaiting stock.
    Placed,
    /// Stock reserved for every line.
    Confirmed,
    /// Cancelled; terminal.
    Cancelled,
}

/// State of the `order` aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderState {
    /// The ordering customer.
    pub customer: String,
    /// Ordered lines.
    pub lines: Vec<OrderLine>,
    /// Current status.
    pub status: OrderStatus,
    /// Set once cancelled.
    pub cancellation_reason: Option<String>,
}

impl AggregateState for OrderState {
    const AGGREGATE_TYPE: &'static str = "order";
}

impl OrderState {
    /// Order total in cents.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if a line total or the sum overflows.
    pub fn total_cents(&self) -> Result<i64, DomainError> {
        total_of(&self.lines)
    }

    /// Places a draft order.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the order was already placed, has
    /// no lines, a line has zero quantity, or the total overflows.
    pub fn place(
        &mut self,
        customer: &str,
        lines: Vec<OrderLine>,
    ) -> Result<Vec<MessageDraft>, DomainError> {
        if self.status != OrderStatus::Draft {
            return Err(DomainError::Validation("order already placed".to_owned()));
        }
        if lines.is_empty() {
            return Err(DomainError::Validation("order has no lines".to_owned()));
        }
        if let Some(line) = lines.iter().find(|line| line.quantity == 0) {
            return Err(DomainError::Validation(format!(
                "line for {} has zero quantity",
                line.sku
            )));
        }
        let total_cents = total_of(&lines)?;
        customer.clone_into(&mut self.customer);
        self.lines = lines;
        self.status = OrderStatus::Placed;
        let payload = OrderPlaced {
            customer: self.customer.clone(),
            lines: self.lines.clone(),
            total_cents,
        };
        Ok(vec![MessageDraft::new(ORDER_PLACED_MESSAGE_TYPE, &payload)?])
    }

    /// Confirms a placed order once its stock is reserved.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` unless the order is placed.
    pub fn confirm(&mut self) -> Result<Vec<MessageDraft>, DomainError> {
        if self.status != OrderStatus::Placed {
            return Err(DomainError::Validation(format!(
                "cannot confirm an order in status {:?}",
                self.status
            )));
        }
        let total_cents = self.total_cents()?;
        self.status = OrderStatus::Confirmed;
        let payload = OrderConfirmed { total_cents };
        Ok(vec![MessageDraft::new(ORDER_CONFIRMED_MESSAGE_TYPE, &payload)?])
    }

    /// Cancels an order that is not cancelled yet.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the order is already cancelled.
    pub fn cancel(&mut self, reason: &str) -> Result<Vec<MessageDraft>, DomainError> {
        if self.status == OrderStatus::Cancelled {
            return Err(DomainError::Validation("order already cancelled".to_owned()));
        }
        self.status = OrderStatus::Cancelled;
        self.cancellation_reason = Some(reason.to_owned());
        let payload = OrderCancelled {
            reason: reason.to_owned(),
        };
        Ok(vec![MessageDraft::new(ORDER_CANCELLED_MESSAGE_TYPE, &payload)?])
    }
}

fn total_of(lines: &[OrderLine]) -> Result<i64, DomainError> {
    lines.iter().try_fold(0_i64, |total, line| {
        total
            .checked_add(line.total_cents()?)
            .ok_or_else(|| DomainError::Validation("order total overflows".to_owned()))
    })
}

/// State of the `stock_item` aggregate. Stock is contended, so rows are
/// locked for the whole transaction instead of version-checked at commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockItemState {
    /// Stock keeping unit.
    pub sku: String,
    /// Units not reserved.
    pub available: u32,
    /// Reserved units per order.
    pub reservations: BTreeMap<String, u32>,
}

impl AggregateState for StockItemState {
    const AGGREGATE_TYPE: &'static str = "stock_item";
    const CONCURRENCY: ConcurrencyPolicy = ConcurrencyPolicy::Pessimistic;
}

impl StockItemState {
    /// Units reserved across all orders.
    #[must_use]
    pub fn reserved(&self) -> u32 {
        self.reservations.values().sum()
    }

    /// Adds received units.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a zero quantity.
    pub fn receive(&mut self, sku: &str, quantity: u32) -> Result<Vec<MessageDraft>, DomainError> {
        if quantity == 0 {
            return Err(DomainError::Validation("received quantity is zero".to_owned()));
        }
        sku.clone_into(&mut self.sku);
        self.available = self.available.saturating_add(quantity);
        let payload = StockReceived {
            sku: self.sku.clone(),
            quantity,
            available: self.available,
        };
        Ok(vec![MessageDraft::new(STOCK_RECEIVED_MESSAGE_TYPE, &payload)?])
    }

    /// Holds `quantity` units for `order_id`. Reserving again for the same
    /// order is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if fewer than `quantity` units are
    /// available.
    pub fn reserve(&mut self, order_id: &str, quantity: u32) -> Result<Vec<MessageDraft>, DomainError> {
        if self.reservations.contains_key(order_id) {
            return Ok(Vec::new());
        }
        if self.available < quantity {
            return Err(DomainError::Validation(format!(
                "insufficient stock for {}: {} available, {} requested",
                self.sku, self.available, quantity
            )));
        }
        self.available -= quantity;
        self.reservations.insert(order_id.to_owned(), quantity);
        let payload = StockReserved {
            sku: self.sku.clone(),
            order_id: order_id.to_owned(),
            quantity,
        };
        Ok(vec![MessageDraft::new(STOCK_RESERVED_MESSAGE_TYPE, &payload)?])
    }

    /// Gives back the units held for `order_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the payload does not
    /// serialize.
    pub fn release(&mut self, order_id: &str) -> Result<Vec<MessageDraft>, DomainError> {
        let Some(quantity) = self.reservations.remove(order_id) else {
            return Ok(Vec::new());
        };
        self.available = self.available.saturating_add(quantity);
        let payload = StockReleased {
            sku: self.sku.clone(),
            order_id: order_id.to_owned(),
            quantity,
        };
        Ok(vec![MessageDraft::new(STOCK_RELEASED_MESSAGE_TYPE, &payload)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(sku: &str, quantity: u32) -> OrderLine {
        OrderLine {
            sku: sku.to_owned(),
            quantity,
            unit_price_cents: 250,
        }
    }

    #[test]
    fn test_place_records_lines_and_emits_order_placed() {
        // Arrange
        let mut order = OrderState::default();

        // Act
        let drafts = order.place("ada", vec![line("SKU-1", 2), line("SKU-2", 1)]).unwrap();

        // Assert
        assert_eq!(order.status, OrderStatus::Placed);
        assert_eq!(order.total_cents().unwrap(), 750);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].message_type(), ORDER_PLACED_MESSAGE_TYPE);
    }

    #[test]
    fn test_place_rejects_empty_and_zero_quantity_orders() {
        let mut order = OrderState::default();

        assert!(matches!(order.place("ada", Vec::new()), Err(DomainError::Validation(_))));
        assert!(matches!(
            order.place("ada", vec![line("SKU-1", 0)]),
            Err(DomainError::Validation(_))
        ));
        assert_eq!(order.status, OrderStatus::Draft);
    }

    #[test]
    fn test_place_rejects_overflowing_total() {
        // Arrange
        let mut order = OrderState::default();
        let pricey = OrderLine {
            sku: "SKU-1".to_owned(),
            quantity: 3,
            unit_price_cents: i64::MAX / 2,
        };

        // Act
        let result = order.place("ada", vec![pricey]);

        // Assert
        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert_eq!(order.status, OrderStatus::Draft);
        assert!(order.lines.is_empty());
    }

    #[test]
    fn test_place_rejects_lines_whose_sum_overflows() {
        let mut order = OrderState::default();
        let half = OrderLine {
            sku: "SKU-1".to_owned(),
            quantity: 1,
            unit_price_cents: i64::MAX / 2 + 1,
        };

        let result = order.place("ada", vec![half.clone(), half]);

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_confirm_requires_placed_order() {
        let mut order = OrderState::default();

        assert!(order.confirm().is_err());
        order.place("ada", vec![line("SKU-1", 1)]).unwrap();
        assert!(order.confirm().is_ok());
        assert_eq!(order.status, OrderStatus::Confirmed);
    }

    #[test]
    fn test_cancel_twice_is_rejected() {
        let mut order = OrderState::default();
        order.place("ada", vec![line("SKU-1", 1)]).unwrap();

        order.cancel("changed mind").unwrap();
        let again = order.cancel("changed mind");

        assert!(matches!(again, Err(DomainError::Validation(_))));
        assert_eq!(order.cancellation_reason.as_deref(), Some("changed mind"));
    }

    #[test]
    fn test_reserve_and_release_move_units() {
        // Arrange
        let mut stock = StockItemState::default();
        stock.receive("SKU-1", 5).unwrap();

        // Act
        stock.reserve("o-1", 3).unwrap();
        let repeated = stock.reserve("o-1", 3).unwrap();
        let short = stock.reserve("o-2", 3);

        // Assert
        assert!(repeated.is_empty());
        assert!(matches!(short, Err(DomainError::Validation(_))));
        assert_eq!(stock.available, 2);
        assert_eq!(stock.reserved(), 3);

        let released = stock.release("o-1").unwrap();
        assert_eq!(released[0].message_type(), STOCK_RELEASED_MESSAGE_TYPE);
        assert_eq!(stock.available, 5);
        assert!(stock.release("o-1").unwrap().is_empty());
    }
}
