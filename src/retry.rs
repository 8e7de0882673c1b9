//! Exponential backoff policy.

use crate::config::ClientConfig;
use std::time::Duration;

/// Share of the computed wait added as random jitter, at most.
const JITTER_RATIO: f64 = 0.1;

/// Backoff settings for one logical call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Multiplier, in seconds.
    pub backoff_factor: f64,
    /// Upper bound for one wait.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Policy taken from a config snapshot.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_factor: config.backoff_factor,
            max_backoff: config.max_backoff,
        }
    }

    /// Wait before the `retry`-th retry (1-based), without jitter.
    ///
    /// `backoff_factor * 2^retry` seconds, raised to `retry_after` when the
    /// server asked for longer, and capped at `max_backoff`.
    pub fn base_delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX).min(62);
        let secs = self.backoff_factor * 2f64.powi(exponent);
        let computed = if secs.is_finite() {
            Duration::try_from_secs_f64(secs).unwrap_or(self.max_backoff)
        } else {
            self.max_backoff
        };

        computed
            .max(retry_after.unwrap_or_default())
            .min(self.max_backoff)
    }

    /// Wait before the `retry`-th retry, plus additive jitter.
    ///
    /// Jitter only ever lengthens the wait, so it never drops below
    /// [`RetryPolicy::base_delay`].
    pub fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let base = self.base_delay(retry, retry_after);
        let jitter = base.mul_f64(rand::random::<f64>() * JITTER_RATIO);
        base + jitter
    }
}
