//! Retry delay policy: a fixed base-delay table with symmetric jitter.

use std::time::Duration;

use rand::prelude::*;

use crate::config::RetryConfig;

const DEFAULT_DELAYS_SECS: [f64; 5] = [1.0, 5.0, 15.0, 60.0, 300.0];
const MIN_DELAY_SECS: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    delays_secs: Vec<f64>,
    jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            delays_secs: DEFAULT_DELAYS_SECS.to_vec(),
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Build a policy from retry configuration. An empty table falls back to
    /// the default `[1, 5, 15, 60, 300]`.
    pub fn from_config(config: &RetryConfig) -> Self {
        let delays_secs = if config.delays_secs.is_empty() {
            DEFAULT_DELAYS_SECS.to_vec()
        } else {
            config.delays_secs.clone()
        };

        Self {
            delays_secs,
            jitter_factor: config.jitter_factor,
        }
    }

    /// Base delay (before jitter) for a 1-based retry attempt.
    ///
    /// Attempt 0 is treated as attempt 1; attempts past the end of the table
    /// reuse the last entry.
    pub fn base_delay_secs(&self, retry_attempt: u32) -> f64 {
        let index = (retry_attempt.max(1) as usize - 1).min(self.delays_secs.len() - 1);
        self.delays_secs[index]
    }

    /// Delay before retry number `retry_attempt`, jittered by
    /// `base * jitter_factor * U(-1, 1)` and floored at 100ms.
    ///
    /// A delay that is not representable (infinite, overflowing) falls back to
    /// the largest usable table entry.
    pub fn delay(&self, retry_attempt: u32) -> Duration {
        let base = self.base_delay_secs(retry_attempt);
        let spread: f64 = rand::rng().random_range(-1.0..=1.0);
        let secs = base + base * self.jitter_factor * spread;
        if !secs.is_finite() {
            return self.max_usable_delay();
        }
        Duration::try_from_secs_f64(secs.max(MIN_DELAY_SECS)).unwrap_or_else(|_| self.max_usable_delay())
    }

    fn max_usable_delay(&self) -> Duration {
        self.delays_secs
            .iter()
            .filter_map(|secs| Duration::try_from_secs_f64(*secs).ok())
            .max()
            .unwrap_or(Duration::from_secs_f64(MIN_DELAY_SECS))
            .max(Duration::from_secs_f64(MIN_DELAY_SECS))
    }
}
