//! Token-bucket arithmetic shared by the local and distributed limiters
//!
//! Refill is continuous: `tokens + elapsed * rate`, clamped to capacity. Both
//! limiters run the same functions, one on an in-memory balance and one on a
//! record read from the shared store.

use crate::error::{ResilienceError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Slack absorbing float drift from many small refills
const TOKEN_EPSILON: f64 = 1e-9;

/// Capacity and refill rate of one bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BucketParams {
    pub capacity: f64,
    pub refill_rate: f64,
}

impl BucketParams {
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        if !capacity.is_finite() || capacity <= 0.0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "bucket capacity must be a positive number, got {capacity}"
            )));
        }
        if !refill_rate.is_finite() || refill_rate < 0.0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "bucket refill rate must be >= 0, got {refill_rate}"
            )));
        }
        Ok(Self {
            capacity,
            refill_rate,
        })
    }

    /// Balance after `elapsed` of refill, never above capacity
    pub fn refill(&self, tokens: f64, elapsed: Duration) -> f64 {
        (tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity)
    }

    /// Take `n` tokens from `tokens` if there are enough
    pub fn take(&self, tokens: f64, n: u32) -> (f64, bool) {
        let n = f64::from(n);
        if tokens + TOKEN_EPSILON >= n {
            ((tokens - n).max(0.0), true)
        } else {
            (tokens, false)
        }
    }

    /// Time until `tokens` grows to `n`
    pub fn wait_time(&self, tokens: f64, n: u32) -> Duration {
        let deficit = f64::from(n) - tokens;
        if deficit <= TOKEN_EPSILON {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(deficit / self.refill_rate).unwrap_or(Duration::MAX)
    }

    /// Time for an empty bucket to fill up, `None` if it never refills
    pub fn time_to_full(&self) -> Option<Duration> {
        if self.refill_rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(self.capacity / self.refill_rate).ok()
    }
}

/// Bucket state as stored in the shared store
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct BucketRecord {
    pub tokens: f64,
    /// Wall-clock milliseconds since the Unix epoch
    pub last_refill_ms: u64,
}

impl BucketRecord {
    pub fn full(params: &BucketParams, now_ms: u64) -> Self {
        Self {
            tokens: params.capacity,
            last_refill_ms: now_ms,
        }
    }

    /// Refill up to `now_ms`; a clock behind `last_refill_ms` adds nothing
    pub fn refilled(self, params: &BucketParams, now_ms: u64) -> Self {
        let elapsed = Duration::from_millis(now_ms.saturating_sub(self.last_refill_ms));
        let tokens = if self.tokens.is_finite() {
            self.tokens.clamp(0.0, params.capacity)
        } else {
            params.capacity
        };
        Self {
            tokens: params.refill(tokens, elapsed),
            last_refill_ms: self.last_refill_ms.max(now_ms),
        }
    }
}
