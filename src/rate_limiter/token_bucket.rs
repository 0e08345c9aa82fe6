//! In-process token bucket
//!
//! Refill, check and subtract happen in a single critical section, so
//! concurrent callers can never be admitted on the same tokens.

use super::bucket::BucketParams;
use super::Limiter;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Rate limiter using token bucket algorithm
///
/// Starts full, so up to `capacity` calls can burst immediately. Cloning
/// yields a handle to the same bucket.
///
/// # Example
/// ```no_run
/// use bulwark::{Limiter, ResilienceError, TokenBucketLimiter};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), ResilienceError> {
///     // Bursts of 100, refilled at 100 tokens per second
///     let limiter = TokenBucketLimiter::per_second(100)?;
///
///     if limiter.allow() {
///         // admitted
///     }
///
///     // Or block until a token frees up
///     limiter.wait(&CancellationToken::new()).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct TokenBucketLimiter {
    params: BucketParams,
    state: Arc<Mutex<BucketState>>,
}

impl TokenBucketLimiter {
    /// Create a new rate limiter
    ///
    /// # Arguments
    /// * `capacity` - Maximum tokens (burst allowance), must be positive
    /// * `refill_rate` - Tokens added per second, must be non-negative
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        let params = BucketParams::new(capacity, refill_rate)?;
        Ok(Self {
            params,
            state: Arc::new(Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
        })
    }

    /// Create a rate limiter with requests per second
    pub fn per_second(requests_per_second: u32) -> Result<Self> {
        Self::new(
            f64::from(requests_per_second),
            f64::from(requests_per_second),
        )
    }

    /// Create a rate limiter with requests per minute
    pub fn per_minute(requests_per_minute: u32) -> Result<Self> {
        Self::new(
            f64::from(requests_per_minute),
            f64::from(requests_per_minute) / 60.0,
        )
    }

    pub fn capacity(&self) -> f64 {
        self.params.capacity
    }

    /// Tokens added per second
    pub fn refill_rate(&self) -> f64 {
        self.params.refill_rate
    }

    /// Take one token if available
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Take `n` tokens if available
    pub fn allow_n(&self, n: u32) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = self.params.refill(state.tokens, elapsed);
        state.last_refill = now;

        let (tokens, admitted) = self.params.take(state.tokens, n);
        state.tokens = tokens;
        admitted
    }

    /// Time until one token is available
    pub fn reserve(&self) -> Duration {
        self.reserve_n(1)
    }

    /// Time until `n` tokens are available; does not take them
    pub fn reserve_n(&self, n: u32) -> Duration {
        self.params.wait_time(self.tokens(), n)
    }

    /// Current balance including refill up to now; does not mutate
    pub fn tokens(&self) -> f64 {
        let now = Instant::now();
        let state = self.state.lock();
        self.params.refill(
            state.tokens,
            now.saturating_duration_since(state.last_refill),
        )
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    fn capacity(&self) -> f64 {
        TokenBucketLimiter::capacity(self)
    }

    async fn allow_n(&self, n: u32) -> bool {
        TokenBucketLimiter::allow_n(self, n)
    }

    async fn reserve_n(&self, n: u32) -> Duration {
        TokenBucketLimiter::reserve_n(self, n)
    }

    async fn tokens(&self) -> f64 {
        TokenBucketLimiter::tokens(self)
    }
}
