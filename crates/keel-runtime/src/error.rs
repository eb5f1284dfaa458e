//! Keel runtime error types.

use keel_core::error::DomainError;
use thiserror::Error;

/// An environment variable holds a value that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The value does not parse.
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// What a valid value looks like.
        expected: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Startup and runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Configuration could not be read.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A domain operation failed.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The tracing subscriber could not be installed.
    #[error("telemetry error: {0}")]
    Telemetry(String),
}
