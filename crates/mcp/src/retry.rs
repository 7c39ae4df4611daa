//! Reconnect backoff policy.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff parameters, consumed by a single retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up. Zero disables retries entirely.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to 50% random extra delay to avoid thundering herds.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`, plus jitter if enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);

        if self.jitter {
            let extra = rand::thread_rng().gen_range(0.0..=0.5);
            raw.mul_f64(1.0 + extra).min(self.max_delay.mul_f64(1.5))
        } else {
            raw
        }
    }
}
