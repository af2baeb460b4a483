//! Retry policy for failed queue items.
//!
//! The delay before the n-th retry is `min(max_delay, base_delay * 2^(n-1))`
//! plus up to 20% jitter. The jitter is supplied by the caller as a fraction
//! in `[0, 1]` so the engine stays deterministic.

use serde::{Deserialize, Serialize};

/// Default base delay (1 second).
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
/// Default delay ceiling (1 minute).
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
/// Default retry ceiling.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Maximum jitter as a share of the computed delay.
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on the pre-jitter delay, in milliseconds
    pub max_delay_ms: u64,
    /// Failures tolerated before an item is permanently failed
    pub max_retries: u32,
    /// Maximum jitter as a share of the delay
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given delays and retry ceiling.
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_retries,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }

    /// Pre-jitter delay after `attempts` failures.
    ///
    /// Zero attempts means the item never ran, so there is no delay.
    pub fn delay_ms(&self, attempts: u32) -> u64 {
        if attempts == 0 {
            return 0;
        }
        let factor = 1u64.checked_shl(attempts - 1).unwrap_or(u64::MAX);
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Jitter for a given pre-jitter delay. `fraction` is clamped to `[0, 1]`.
    pub fn jitter_ms(&self, delay_ms: u64, fraction: f64) -> u64 {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        (delay_ms as f64 * self.jitter_ratio * fraction) as u64
    }

    /// Largest jitter that can be added to a given delay.
    pub fn max_jitter_ms(&self, delay_ms: u64) -> u64 {
        self.jitter_ms(delay_ms, 1.0)
    }

    /// Whether an item with this many failures has exceeded the ceiling.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_retries
    }
}
