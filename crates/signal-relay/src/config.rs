//! Relay configuration.
//!
//! Configuration is loaded from environment variables with sensible
//! defaults. One listener serves the WebSocket endpoint, the status and
//! health endpoints, and Prometheus metrics.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default bind address for the combined WebSocket/HTTP listener.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default ring timeout: how long a call may sit unanswered before the
/// relay fails it.
pub const DEFAULT_RING_TIMEOUT_SECONDS: u64 = 30;

/// Default retention for terminal call records before they are swept.
pub const DEFAULT_TERMINAL_RETENTION_SECONDS: u64 = 300;

/// Default interval of the orchestrator's timeout/retention sweep.
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 5;

/// Relay configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Combined listener bind address (default: "0.0.0.0:3000").
    pub bind_address: String,

    /// Ring timeout in seconds (default: 30).
    pub ring_timeout_seconds: u64,

    /// Terminal call retention in seconds (default: 300).
    pub terminal_retention_seconds: u64,

    /// Sweep interval in seconds (default: 5).
    pub sweep_interval_seconds: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable is present but
    /// unparsable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable is present but
    /// unparsable.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let ring_timeout_seconds = parse_seconds(
            vars,
            "RELAY_RING_TIMEOUT_SECONDS",
            DEFAULT_RING_TIMEOUT_SECONDS,
        )?;

        let terminal_retention_seconds = parse_seconds(
            vars,
            "RELAY_TERMINAL_RETENTION_SECONDS",
            DEFAULT_TERMINAL_RETENTION_SECONDS,
        )?;

        let sweep_interval_seconds = parse_seconds(
            vars,
            "RELAY_SWEEP_INTERVAL_SECONDS",
            DEFAULT_SWEEP_INTERVAL_SECONDS,
        )?;

        Ok(Config {
            bind_address,
            ring_timeout_seconds,
            terminal_retention_seconds,
            sweep_interval_seconds,
        })
    }

    /// Ring timeout as a [`Duration`].
    #[must_use]
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_seconds)
    }

    /// Terminal retention as a [`Duration`].
    #[must_use]
    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_seconds)
    }

    /// Sweep interval as a [`Duration`].
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

fn parse_seconds(
    vars: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match vars.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
