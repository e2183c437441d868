//! Exponential backoff with jitter for retry scheduling
//!
//! Delay for attempt `n` is `min(base * 2^n, max)` scaled by a random
//! factor in `[1.0, 1.1]`. Jitter only ever lengthens the delay, so the
//! result never exceeds `max * 1.1` and never drops below the capped base.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Upper bound of the multiplicative jitter factor
pub const MAX_JITTER_FACTOR: f64 = 1.1;

// 2^1023 is the largest power of two an f64 holds; anything beyond is capped anyway.
const MAX_EXPONENT: u32 = 1023;

/// Backoff calculator bound to one source's policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    /// Create a calculator for the given policy
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Capped exponential delay for an attempt, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_EXPONENT) as i32;
        let base = self.config.base_delay_ms as f64 * 2f64.powi(exponent);
        // Never above max_delay_ms, so the cast back is lossless
        let capped = base.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay to wait before retry number `attempt` (0-based), with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(1.0..=MAX_JITTER_FACTOR);
        self.base_delay(attempt).mul_f64(jitter)
    }

}
