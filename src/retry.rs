//! Bounded retry with exponential backoff
//!
//! Shared by [`crate::CircuitBreaker::execute_with_retry`] and
//! [`crate::DistributedLock::acquire_with_retry`]. None of the primitives
//! retry on their own; this is the caller-side loop they compose with.

use crate::error::{ResilienceError, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How many times to try, and how long to pause in between
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after every attempt (1.0 = fixed delay)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Fixed delay between a bounded number of attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to sleep after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::InvalidConfig(
                "retry max_attempts must be > 0".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ResilienceError::InvalidConfig(
                "retry backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sleep for `delay` unless `cancel` fires first
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ResilienceError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(20));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(4), Duration::from_millis(20));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(ResilienceError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel_returns_promptly() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let result = sleep_or_cancel(&cancel, Duration::from_secs(60)).await;

        assert_eq!(result, Err(ResilienceError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
