//! Server configuration.
//!
//! Configuration is loaded from `RELAY_`-prefixed environment variables.
//! Every field has a default, so a bare `chat-server` starts without any
//! environment at all.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default TCP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:4545";

/// Default interval between session ticks, in milliseconds.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 200;

/// Default hold-back before delayed replies are flushed, in milliseconds.
pub const DEFAULT_DELAYED_RESPONSE_MS: u64 = 5_000;

/// Default inactivity timeout before authentication, in milliseconds.
pub const DEFAULT_PREAUTH_IDLE_TIMEOUT_MS: u64 = 600_000;

/// Default inactivity timeout for an authenticated session (5 hours),
/// in milliseconds.
pub const DEFAULT_AUTHED_IDLE_TIMEOUT_MS: u64 = 18_000_000;

/// Default number of write attempts before a session is dropped.
pub const DEFAULT_WRITE_RETRY_LIMIT: u32 = 100;

/// Default name of the account that receives mirrored watched traffic.
pub const DEFAULT_SURVEILLANCE_IDENTITY: &str = "agency";

/// Server configuration, loaded from environment variables with
/// sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP bind address (default: "0.0.0.0:4545").
    pub bind_address: String,

    /// Interval between session ticks.
    pub tick_interval: Duration,

    /// How long delayed replies are held before being flushed.
    pub delayed_response_hold: Duration,

    /// Inactivity timeout for sessions that have not logged in.
    pub preauth_idle_timeout: Duration,

    /// Inactivity timeout for logged-in sessions.
    pub authed_idle_timeout: Duration,

    /// Write attempts per frame before the session is dropped.
    pub write_retry_limit: u32,

    /// Account name that receives mirrored copies of watched traffic.
    pub surveillance_identity: String,

    /// Optional path to a newline-separated forbidden-words list. When
    /// unset, a small built-in list is used.
    pub forbidden_words_file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let tick_interval = Duration::from_millis(parse_var(
            vars,
            "RELAY_TICK_INTERVAL_MS",
            DEFAULT_TICK_INTERVAL_MS,
        )?);

        let delayed_response_hold = Duration::from_millis(parse_var(
            vars,
            "RELAY_DELAYED_RESPONSE_MS",
            DEFAULT_DELAYED_RESPONSE_MS,
        )?);

        let preauth_idle_timeout = Duration::from_millis(parse_var(
            vars,
            "RELAY_PREAUTH_IDLE_TIMEOUT_MS",
            DEFAULT_PREAUTH_IDLE_TIMEOUT_MS,
        )?);

        let authed_idle_timeout = Duration::from_millis(parse_var(
            vars,
            "RELAY_AUTHED_IDLE_TIMEOUT_MS",
            DEFAULT_AUTHED_IDLE_TIMEOUT_MS,
        )?);

        let write_retry_limit =
            parse_var(vars, "RELAY_WRITE_RETRY_LIMIT", DEFAULT_WRITE_RETRY_LIMIT)?;

        let surveillance_identity = vars
            .get("RELAY_SURVEILLANCE_IDENTITY")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SURVEILLANCE_IDENTITY.to_string());

        let forbidden_words_file = vars.get("RELAY_FORBIDDEN_WORDS_FILE").map(PathBuf::from);

        Ok(Config {
            bind_address,
            tick_interval,
            delayed_response_hold,
            preauth_idle_timeout,
            authed_idle_timeout,
            write_retry_limit,
            surveillance_identity,
            forbidden_words_file,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name, raw.clone())),
    }
}
