//! Order fulfilment saga.
//!
//! One saga per order, keyed by `("fulfilment", order id)`. A placed order
//! triggers a transaction that reserves stock for every line and confirms
//! the order. When reservation fails the step records the failure and emits
//! a compensation, which cancels the order in a transaction of its own.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::aggregate::AggregateId;
use keel_core::clock::Clock;
use keel_core::error::DomainError;
use keel_core::manager::{Context, UnitOfWorkManager};
use keel_core::message::{Message, MessageDraft};
use keel_core::repository::Repository;
use keel_core::transaction::LocalTransactionCoordinator;
use keel_saga::definition::{
    MessagePattern, SagaDefinition, SagaHandler, SagaStepError, StepContext,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::application::command_handlers::{
    handle_cancel_order, handle_confirm_order, handle_reserve_stock,
};
use crate::domain::aggregates::{OrderState, StockItemState};
use crate::domain::commands::{CancelOrder, ConfirmOrder, ReserveStock};
use crate::domain::events::{
    ORDER_CANCELLED_MESSAGE_TYPE, ORDER_CONFIRMED_MESSAGE_TYPE, ORDER_PLACED_MESSAGE_TYPE,
    OrderPlaced,
};

/// Saga queue order messages are routed to.
pub const FULFILMENT_QUEUE: &str = "fulfilment";

/// Name of the fulfilment saga definition.
pub const FULFILMENT_SAGA: &str = "order-fulfilment";

/// Message type of the compensation emitted when reservation fails.
pub const FULFILMENT_COMPENSATE_MESSAGE_TYPE: &str = "fulfilment.compensate";

/// Payload of the compensation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FulfilmentCompensation {
    /// Why fulfilment failed.
    pub reason: String,
}

/// How a fulfilment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfilmentOutcome {
    /// Stock reserved and order confirmed.
    Confirmed,
    /// Order cancelled.
    Cancelled,
}

/// Saga state of one fulfilment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfilmentProgress {
    /// Stock is held for the order.
    pub reserved: bool,
    /// Set when the saga completes.
    pub outcome: Option<FulfilmentOutcome>,
}

/// Step handler of the fulfilment saga.
#[derive(Clone)]
pub struct FulfilmentSaga {
    coordinator: Arc<LocalTransactionCoordinator>,
    orders: Repository<OrderState>,
    stock: Repository<StockItemState>,
    clock: Arc<dyn Clock>,
}

impl FulfilmentSaga {
    /// Creates the handler; each step runs its commands in a transaction of
    /// `coordinator`.
    #[must_use]
    pub fn new(
        coordinator: Arc<LocalTransactionCoordinator>,
        manager: Arc<UnitOfWorkManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            coordinator,
            orders: Repository::new(Arc::clone(&manager)),
            stock: Repository::new(manager),
            clock,
        }
    }

    /// The saga definition, initiated by `order.placed`.
    #[must_use]
    pub fn definition(self) -> SagaDefinition {
        let pattern = MessagePattern::Types(
            [
                ORDER_PLACED_MESSAGE_TYPE,
                ORDER_CONFIRMED_MESSAGE_TYPE,
                ORDER_CANCELLED_MESSAGE_TYPE,
                FULFILMENT_COMPENSATE_MESSAGE_TYPE,
            ]
            .map(str::to_owned)
            .to_vec(),
        );
        SagaDefinition::new(FULFILMENT_SAGA, FULFILMENT_QUEUE, pattern, move || self.clone())
            .initiated_by(ORDER_PLACED_MESSAGE_TYPE)
    }

    async fn reserve_and_confirm(
        &self,
        order_id: &AggregateId,
        placed: OrderPlaced,
        correlation_id: Uuid,
    ) -> Result<(), DomainError> {
        let tx = self.coordinator.begin();
        let ctx = Context::new(tx).with_correlation_id(correlation_id);
        let reserve = ReserveStock {
            correlation_id,
            order_id: order_id.clone(),
            lines: placed.lines,
        };
        let confirm = ConfirmOrder {
            correlation_id,
            order_id: order_id.clone(),
        };
        let result = match handle_reserve_stock(&ctx, &reserve, self.clock.as_ref(), &self.stock).await {
            Ok(_) => handle_confirm_order(&ctx, &confirm, self.clock.as_ref(), &self.orders)
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        self.coordinator.finish(tx, result).await
    }

    async fn cancel(&self, order_id: &AggregateId, reason: String, correlation_id: Uuid) -> Result<(), DomainError> {
        let tx = self.coordinator.begin();
        let ctx = Context::new(tx).with_correlation_id(correlation_id);
        let command = CancelOrder {
            correlation_id,
            order_id: order_id.clone(),
            reason,
        };
        let result = handle_cancel_order(&ctx, &command, self.clock.as_ref(), &self.orders)
            .await
            .map(|_| ());
        self.coordinator.finish(tx, result).await
    }
}

#[async_trait]
impl SagaHandler for FulfilmentSaga {
    async fn handle(
        &self,
        step: &mut StepContext<'_>,
        message: &Message,
    ) -> Result<(), SagaStepError> {
        let mut progress: FulfilmentProgress = step.state_as()?;
        let order_id = AggregateId::from(step.key().token.as_str());
        let correlation_id = message.correlation_id.unwrap_or_else(Uuid::now_v7);

        match message.message_type.as_str() {
            ORDER_PLACED_MESSAGE_TYPE => {
                let placed: OrderPlaced = message.payload_as()?;
                if let Err(err) = self.reserve_and_confirm(&order_id, placed, correlation_id).await {
                    let reason = err.to_string();
                    let compensation = MessageDraft::new(
                        FULFILMENT_COMPENSATE_MESSAGE_TYPE,
                        &FulfilmentCompensation {
                            reason: reason.clone(),
                        },
                    )?;
                    return Err(SagaStepError::new(reason).with_compensation(compensation));
                }
                progress.reserved = true;
            }
            FULFILMENT_COMPENSATE_MESSAGE_TYPE => {
                let compensation: FulfilmentCompensation = message.payload_as()?;
                self.cancel(&order_id, compensation.reason, correlation_id).await?;
            }
            ORDER_CONFIRMED_MESSAGE_TYPE => {
                progress.outcome = Some(FulfilmentOutcome::Confirmed);
                step.complete();
            }
            ORDER_CANCELLED_MESSAGE_TYPE => {
                progress.outcome = Some(FulfilmentOutcome::Cancelled);
                step.complete();
            }
            other => {
                tracing::debug!(message_type = other, "fulfilment ignores message");
            }
        }
        step.set_state(&progress)?;
        Ok(())
    }
}
