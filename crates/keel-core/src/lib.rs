//! Keel Core: aggregate lifecycle and transactional unit of work.
//!
//! Aggregates buffer the messages their operations emit; a unit of work
//! bound to the ambient transaction drains and persists them at pre-commit
//! and publishes them only after the transaction has committed.

pub mod aggregate;
pub mod clock;
pub mod command;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod message;
pub mod repository;
pub mod transaction;
pub mod unit_of_work;
