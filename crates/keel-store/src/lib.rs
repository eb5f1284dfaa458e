//! Keel Store: aggregate stores.
//!
//! [`memory::InMemoryAggregateStore`] stages writes per transaction in
//! process memory. [`pg::PgAggregateStore`] maps each coordinator
//! transaction onto a `PostgreSQL` transaction.

pub mod memory;
pub mod pg;
pub mod schema;
