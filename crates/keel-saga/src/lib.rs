//! Keel Saga: long-running processes driven by committed messages.
//!
//! A [`manager::SagaManager`] receives published messages, matches them
//! against the definitions in a [`definition::SagaRegistry`], and begins or
//! advances the [`saga::Saga`] keyed by the message's queue and tracking
//! token. Progress is persisted through a [`store::SagaStore`] after every
//! step.

pub mod definition;
pub mod manager;
pub mod saga;
pub mod store;
