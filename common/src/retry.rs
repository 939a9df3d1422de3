// Retry delay policies with exponential backoff and jitter
//
// The attempt budget lives on each job (`max_exec_count`); strategies only
// decide how long to wait before the next attempt.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Delay calculation for failed attempts
pub trait RetryStrategy: Send + Sync {
    /// Delay before retrying after `failed_attempts` failures (1-based)
    fn next_delay(&self, failed_attempts: u32) -> Duration;
}

/// Exponential backoff: base * 2^(n-1), capped at max, plus up to `jitter` of extra delay
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30 * 60),
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(base_delay: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::with_config(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter_factor,
        )
    }

    /// Delay without jitter
    fn capped_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor == 0.0 {
            return delay;
        }

        let jitter_range_ms = (delay.as_millis() as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };
        delay + Duration::from_millis(jitter_ms)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, failed_attempts: u32) -> Duration {
        self.add_jitter(self.capped_delay(failed_attempts))
    }
}

/// Same delay after every failure (tests and simple deployments)
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryStrategy for FixedDelay {
    fn next_delay(&self, _failed_attempts: u32) -> Duration {
        self.delay
    }
}
