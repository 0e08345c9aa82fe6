//! Bulwark: concurrency-safe resilience primitives
//!
//! # Overview
//!
//! Three independent building blocks for protecting calls to services that
//! can fail or be overloaded:
//!
//! - **Circuit Breaker**: fails fast while a downstream service is unhealthy
//!   and probes it with a bounded number of calls before trusting it again
//! - **Rate Limiter**: token bucket admission control, either in-process or
//!   shared across processes through a [`SharedStore`]
//! - **Distributed Lock**: best-effort mutual exclusion with a lease (TTL) and
//!   an owner token guarding release and extend
//!
//! None of them retry on their own. [`RetryPolicy`] is the caller-side loop
//! they compose with.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Admission control
//! │  (Token bucket, local or shared)        │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (Tracks failures, opens on threshold)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         External Service
//!
//!  Alongside, for work that must run once:
//!   Locker → DistributedLock → SharedStore (owner token + TTL)
//! ```
//!
//! # Usage Example
//!
//! ## Circuit Breaker
//!
//! ```no_run
//! use bulwark::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 3,
//!     open_timeout: Duration::from_secs(30),
//!     ..Default::default()
//! };
//! let breaker = CircuitBreaker::new("billing-api", config);
//!
//! let result = breaker.execute(|| async {
//!     // Your potentially failing operation
//!     Ok::<_, ResilienceError>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Shared Rate Limit
//!
//! ```no_run
//! use bulwark::{DistributedLimiterConfig, DistributedTokenBucket, FailurePolicy, Limiter, MemoryStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), bulwark::ResilienceError> {
//! let store = Arc::new(MemoryStore::new());
//! let limiter = DistributedTokenBucket::new(
//!     store,
//!     DistributedLimiterConfig::new("ratelimit:export", 20.0, 5.0, FailurePolicy::FailClosed),
//! )?;
//!
//! let result = bulwark::rate_limiter::try_execute(&limiter, || async {
//!     Ok::<_, bulwark::ResilienceError>("exported")
//! }).await;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod lock;
pub mod logging;
pub mod rate_limiter;
pub mod retry;

// Re-export main types for convenience
pub use bulwark_core_store::{MemoryStore, SharedStore, StoreError};
pub use circuit_breaker::{
    BreakerMetrics, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    StateChange,
};
pub use config::ResilienceSettings;
pub use error::{ResilienceError, Result};
pub use lock::{DistributedLock, Locker};
pub use rate_limiter::{
    DistributedLimiterConfig, DistributedTokenBucket, FailurePolicy, Limiter, TokenBucketLimiter,
};
pub use retry::RetryPolicy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use bulwark::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::error::ResilienceError;
    pub use super::lock::{DistributedLock, Locker};
    pub use super::rate_limiter::{
        DistributedTokenBucket, FailurePolicy, Limiter, TokenBucketLimiter,
    };
    pub use super::retry::RetryPolicy;
    pub use bulwark_core_store::SharedStore;
}
