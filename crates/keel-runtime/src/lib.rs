//! Keel runtime: configuration, telemetry and the wiring of a running
//! instance.

pub mod config;
pub mod error;
pub mod runtime;
pub mod telemetry;
pub mod transport;
