//! Configuration management for the sync worker.

use std::env;
use std::time::Duration;

use waypoint_engine::RetryPolicy;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound on the pre-jitter retry delay
    pub max_delay_ms: u64,
    /// Failures tolerated before an item is permanently failed
    pub max_retries: u32,
    /// Whether uploads may use a cellular connection
    pub allow_cellular: bool,
    /// Timeout handed to the remote store with every call
    pub remote_timeout_ms: u64,
    /// How often a network-gated processor re-checks connectivity
    pub network_poll_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_retries: 5,
            allow_cellular: false,
            remote_timeout_ms: 30_000,
            network_poll_ms: 5_000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            base_delay_ms: parse(&lookup, "WAYPOINT_BASE_DELAY_MS", defaults.base_delay_ms)?,
            max_delay_ms: parse(&lookup, "WAYPOINT_MAX_DELAY_MS", defaults.max_delay_ms)?,
            max_retries: parse(&lookup, "WAYPOINT_MAX_RETRIES", defaults.max_retries)?,
            allow_cellular: parse(&lookup, "WAYPOINT_ALLOW_CELLULAR", defaults.allow_cellular)?,
            remote_timeout_ms: parse(
                &lookup,
                "WAYPOINT_REMOTE_TIMEOUT_MS",
                defaults.remote_timeout_ms,
            )?,
            network_poll_ms: parse(&lookup, "WAYPOINT_NETWORK_POLL_MS", defaults.network_poll_ms)?,
        })
    }

    /// Retry policy for the mutation queue.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.base_delay_ms, self.max_delay_ms, self.max_retries)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn network_poll_interval(&self) -> Duration {
        Duration::from_millis(self.network_poll_ms)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(_) => Err(ConfigError::Invalid { key, value }),
        },
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}
