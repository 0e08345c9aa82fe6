//! Rate limiting for preventing service overload
//!
//! Two token-bucket limiters share one algorithm:
//!
//! - [`TokenBucketLimiter`]: in-process, state behind a mutex
//! - [`DistributedTokenBucket`]: state in a [`SharedStore`](bulwark_core_store::SharedStore)
//!   record, so many processes draw from one logical bucket
//!
//! Both implement [`Limiter`], so callers can hold either as `Arc<dyn Limiter>`.

use crate::error::{ResilienceError, Result};
use crate::retry::sleep_or_cancel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) mod bucket;
pub mod distributed;
pub mod token_bucket;

pub use distributed::{DistributedLimiterConfig, DistributedTokenBucket};
pub use token_bucket::TokenBucketLimiter;

/// Shortest pause between two admission attempts in [`Limiter::wait_n`]
const MIN_WAIT: Duration = Duration::from_millis(1);

/// What a store-backed limiter does when the store cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Admit the call and log
    FailOpen,
    /// Reject the call and log
    FailClosed,
}

/// Admission control over a refillable token budget
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Maximum tokens the bucket can hold
    fn capacity(&self) -> f64;

    /// Take `n` tokens if available
    async fn allow_n(&self, n: u32) -> bool;

    /// Take one token if available
    async fn allow(&self) -> bool {
        self.allow_n(1).await
    }

    /// Time until `n` tokens will be available, without taking any
    async fn reserve_n(&self, n: u32) -> Duration;

    /// Time until one token will be available, without taking it
    async fn reserve(&self) -> Duration {
        self.reserve_n(1).await
    }

    /// Current balance, including refill up to now
    async fn tokens(&self) -> f64;

    /// Wait until one token is taken or `cancel` fires
    async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        self.wait_n(cancel, 1).await
    }

    /// Wait until `n` tokens are taken or `cancel` fires
    ///
    /// Fails immediately with [`ResilienceError::ExceedsCapacity`] when `n`
    /// tokens can never fit in the bucket.
    async fn wait_n(&self, cancel: &CancellationToken, n: u32) -> Result<()> {
        let capacity = self.capacity();
        if f64::from(n) > capacity {
            return Err(ResilienceError::ExceedsCapacity {
                requested: n,
                capacity,
            });
        }

        loop {
            if cancel.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }
            if self.allow_n(n).await {
                return Ok(());
            }
            let delay = self.reserve_n(n).await.max(MIN_WAIT);
            sleep_or_cancel(cancel, delay).await?;
        }
    }
}

/// Execute an operation once a token is available
///
/// This will wait until a token is available before executing the operation.
pub async fn execute<L, F, Fut, T>(limiter: &L, cancel: &CancellationToken, op: F) -> Result<T>
where
    L: Limiter + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    limiter.wait(cancel).await?;
    op().await
}

/// Try to execute an operation without waiting
///
/// Returns [`ResilienceError::RateLimitExceeded`] if no token is available.
pub async fn try_execute<L, F, Fut, T>(limiter: &L, op: F) -> Result<T>
where
    L: Limiter + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if limiter.allow().await {
        op().await
    } else {
        Err(ResilienceError::RateLimitExceeded)
    }
}
