//! Error types for the resilience primitives

use bulwark_core_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in resilience operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Circuit breaker is open, rejecting requests
    #[error("Circuit breaker is open, rejecting requests")]
    CircuitOpen,

    /// Half-open probe budget is exhausted
    #[error("Circuit breaker is half-open and its probe budget is exhausted")]
    TooManyRequests,

    /// Rate limit exceeded
    #[error("Rate limit exceeded, retry after cooldown")]
    RateLimitExceeded,

    /// More tokens were requested than the bucket can ever hold
    #[error("Requested {requested} tokens but bucket capacity is {capacity}")]
    ExceedsCapacity { requested: u32, capacity: f64 },

    /// Lock is no longer owned by this handle
    #[error("Lock '{0}' is not held by this handle")]
    LockNotHeld(String),

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Shared store could not be reached or failed
    #[error("Shared store error: {0}")]
    Store(#[from] StoreError),

    /// Transient error that may be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Permanent error that should not be retried
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Timeout occurred
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// Construction parameters were rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file or logging setup failed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ResilienceError {
    /// Check if this error is transient and can be retried
    pub fn is_transient(&self) -> bool {
        match self {
            ResilienceError::Transient(_)
            | ResilienceError::RateLimitExceeded
            | ResilienceError::Timeout(_) => true,
            ResilienceError::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Check if this error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ResilienceError::Permanent(_)
                | ResilienceError::CircuitOpen
                | ResilienceError::InvalidConfig(_)
                | ResilienceError::ExceedsCapacity { .. }
        )
    }

    /// Check if this error should contribute to circuit breaker failure count
    ///
    /// Rejections raised by resilience primitives themselves (a nested
    /// breaker, a cancelled wait) say nothing about the downstream service.
    pub fn should_trip_breaker(&self) -> bool {
        !matches!(
            self,
            ResilienceError::CircuitOpen
                | ResilienceError::TooManyRequests
                | ResilienceError::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, ResilienceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let transient = ResilienceError::Transient("network error".to_string());
        assert!(transient.is_transient());
        assert!(!transient.is_permanent());
        assert!(transient.should_trip_breaker());

        let permanent = ResilienceError::Permanent("auth failed".to_string());
        assert!(!permanent.is_transient());
        assert!(permanent.is_permanent());
        assert!(permanent.should_trip_breaker());

        let circuit_open = ResilienceError::CircuitOpen;
        assert!(!circuit_open.is_transient());
        assert!(circuit_open.is_permanent());
        assert!(!circuit_open.should_trip_breaker());

        assert!(!ResilienceError::TooManyRequests.should_trip_breaker());
        assert!(!ResilienceError::Cancelled.should_trip_breaker());
    }

    #[test]
    fn test_store_errors_follow_store_classification() {
        let outage: ResilienceError = StoreError::Unavailable("refused".to_string()).into();
        assert!(outage.is_transient());

        let backend: ResilienceError = StoreError::Backend("bad script".to_string()).into();
        assert!(!backend.is_transient());
        assert!(backend.should_trip_breaker());
    }
}
