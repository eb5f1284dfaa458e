//! Runtime configuration read from the environment.

use std::time::Duration;

use keel_saga::manager::DEFAULT_MAX_CASCADE;

use crate::error::ConfigError;

/// Default number of dispatcher shards.
pub const DEFAULT_DISPATCH_SHARDS: usize = 4;

/// Default period between sweeps for expired transactions.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(100);

/// Settings for one Keel runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeelConfig {
    /// Dispatcher worker shards (`KEEL_DISPATCH_SHARDS`).
    pub dispatch_shards: usize,
    /// Deadline applied to every transaction (`KEEL_TX_TIMEOUT_MS`).
    pub transaction_timeout: Option<Duration>,
    /// How often expired transactions are rolled back
    /// (`KEEL_TX_REAP_INTERVAL_MS`).
    pub reap_interval: Duration,
    /// Compensation hops per triggering message (`KEEL_SAGA_MAX_CASCADE`).
    pub saga_max_cascade: usize,
    /// PostgreSQL connection string (`DATABASE_URL`); in-memory storage
    /// when absent.
    pub database_url: Option<String>,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            dispatch_shards: DEFAULT_DISPATCH_SHARDS,
            transaction_timeout: None,
            reap_interval: DEFAULT_REAP_INTERVAL,
            saga_max_cascade: DEFAULT_MAX_CASCADE,
            database_url: None,
        }
    }
}

impl KeelConfig {
    /// Reads the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for a value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value. Unset and empty variables take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for a value that does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let dispatch_shards = match get("KEEL_DISPATCH_SHARDS") {
            Some(value) => positive("KEEL_DISPATCH_SHARDS", &value)?,
            None => defaults.dispatch_shards,
        };
        let transaction_timeout = match get("KEEL_TX_TIMEOUT_MS") {
            Some(value) => Some(Duration::from_millis(
                value.trim().parse().map_err(|_| ConfigError::Invalid {
                    name: "KEEL_TX_TIMEOUT_MS",
                    expected: "a number of milliseconds",
                    value: value.clone(),
                })?,
            )),
            None => defaults.transaction_timeout,
        };
        let reap_interval = match get("KEEL_TX_REAP_INTERVAL_MS") {
            Some(value) => Duration::from_millis(
                u64::try_from(positive("KEEL_TX_REAP_INTERVAL_MS", &value)?).map_err(|_| {
                    ConfigError::Invalid {
                        name: "KEEL_TX_REAP_INTERVAL_MS",
                        expected: "a positive integer",
                        value: value.clone(),
                    }
                })?,
            ),
            None => defaults.reap_interval,
        };
        let saga_max_cascade = match get("KEEL_SAGA_MAX_CASCADE") {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "KEEL_SAGA_MAX_CASCADE",
                expected: "a non-negative integer",
                value: value.clone(),
            })?,
            None => defaults.saga_max_cascade,
        };

        Ok(Self {
            dispatch_shards,
            transaction_timeout,
            reap_interval,
            saga_max_cascade,
            database_url: get("DATABASE_URL"),
        })
    }
}

fn positive(name: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ConfigError::Invalid {
            name,
            expected: "a positive integer",
            value: value.to_owned(),
        }),
    }
}
