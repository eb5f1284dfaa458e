//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::RuntimeError;

/// Installs a JSON `fmt` layer filtered by `RUST_LOG`, defaulting to `info`.
///
/// # Errors
///
/// Returns `RuntimeError::Telemetry` if a global subscriber is already set.
pub fn init() -> Result<(), RuntimeError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .map_err(|err| RuntimeError::Telemetry(err.to_string()))
}
