//! Shared test mocks and utilities for Keel.

mod clock;
mod publisher;
mod store;

pub use clock::FixedClock;
pub use publisher::{FailingPublisher, RecordingPublisher};
pub use store::FailingAggregateStore;
