//! Domain model of the orders context.

pub mod aggregates;
pub mod commands;
pub mod events;
