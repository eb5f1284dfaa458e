//! In-memory wiring shared by the application tests.

use std::sync::Arc;

use keel_core::aggregate::AggregateId;
use keel_core::dispatch::MessageDispatcher;
use keel_core::manager::{Context, UnitOfWorkManager};
use keel_core::repository::Repository;
use keel_core::transaction::{LocalTransactionCoordinator, TransactionalResource};
use keel_saga::definition::SagaRegistry;
use keel_saga::manager::SagaManager;
use keel_saga::store::InMemorySagaStore;
use keel_store::memory::InMemoryAggregateStore;
use keel_test_support::{FixedClock, RecordingPublisher};
use uuid::Uuid;

use crate::application::command_handlers::{handle_place_order, handle_receive_stock};
use crate::application::fulfilment::FulfilmentSaga;
use crate::application::query_handlers::{OrderView, get_order_by_id};
use crate::domain::aggregates::{OrderState, StockItemState};
use crate::domain::commands::{PlaceOrder, ReceiveStock};
use crate::domain::events::OrderLine;

pub(crate) fn line(sku: &str, quantity: u32) -> OrderLine {
    OrderLine {
        sku: sku.to_owned(),
        quantity,
        unit_price_cents: 250,
    }
}

pub(crate) struct Harness {
    pub(crate) coordinator: Arc<LocalTransactionCoordinator>,
    pub(crate) store: Arc<InMemoryAggregateStore>,
    pub(crate) publisher: Arc<RecordingPublisher>,
    pub(crate) manager: Arc<UnitOfWorkManager>,
    pub(crate) sagas: SagaManager,
    pub(crate) clock: FixedClock,
}

impl Harness {
    /// Must be called inside a tokio runtime.
    pub(crate) fn new() -> Self {
        let clock = FixedClock::on(2026, 3, 1);
        let store = Arc::new(InMemoryAggregateStore::new());
        let coordinator = Arc::new(LocalTransactionCoordinator::new(vec![
            Arc::clone(&store) as Arc<dyn TransactionalResource>,
        ]));
        let publisher = Arc::new(RecordingPublisher::new());
        let dispatcher = Arc::new(MessageDispatcher::spawn(publisher.clone(), 2));
        let manager = Arc::new(UnitOfWorkManager::new(
            coordinator.clone(),
            store.clone(),
            dispatcher,
        ));
        let fulfilment =
            FulfilmentSaga::new(Arc::clone(&coordinator), Arc::clone(&manager), Arc::new(clock));
        let sagas = SagaManager::new(
            SagaRegistry::new().with(fulfilment.definition()),
            Arc::new(InMemorySagaStore::new()),
            Arc::new(clock),
        );
        Self {
            coordinator,
            store,
            publisher,
            manager,
            sagas,
            clock,
        }
    }

    pub(crate) fn orders(&self) -> Repository<OrderState> {
        Repository::new(Arc::clone(&self.manager))
    }

    pub(crate) fn stock(&self) -> Repository<StockItemState> {
        Repository::new(Arc::clone(&self.manager))
    }

    pub(crate) async fn place_order(&self, lines: Vec<OrderLine>) -> AggregateId {
        let command = PlaceOrder {
            correlation_id: Uuid::now_v7(),
            customer: "ada".to_owned(),
            lines,
        };
        let tx = self.coordinator.begin();
        let result = handle_place_order(&Context::new(tx), &command, &self.clock, &self.orders())
            .await
            .unwrap();
        self.coordinator.commit(tx).await.unwrap();
        result.aggregate_id
    }

    pub(crate) async fn receive_stock(&self, sku: &str, quantity: u32) {
        let command = ReceiveStock {
            correlation_id: Uuid::now_v7(),
            sku: sku.to_owned(),
            quantity,
        };
        let tx = self.coordinator.begin();
        handle_receive_stock(&Context::new(tx), &command, &self.clock, &self.stock())
            .await
            .unwrap();
        self.coordinator.commit(tx).await.unwrap();
    }

    pub(crate) async fn order_view(&self, order_id: &AggregateId) -> OrderView {
        let tx = self.coordinator.begin();
        let view = get_order_by_id(&Context::new(tx), order_id, &self.orders())
            .await
            .unwrap();
        self.coordinator.commit(tx).await.unwrap();
        view
    }
}

#[tokio::test]
async fn test_committed_order_messages_reach_the_publisher() {
    let harness = Harness::new();

    harness.place_order(vec![line("SKU-1", 1)]).await;
    let placed = || {
        harness
            .publisher
            .message_types()
            .iter()
            .any(|t| t == crate::domain::events::ORDER_PLACED_MESSAGE_TYPE)
    };
    for _ in 0..50 {
        if placed() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    assert!(placed());
}
