//! Store-backed token bucket shared by many processes
//!
//! The bucket lives as one JSON record per key. Every admission runs
//! refill-check-subtract inside [`SharedStore::read_modify_write`], so the
//! store's atomicity is what keeps concurrent processes from spending the
//! same tokens. The record is written with a TTL of one full refill; an idle
//! key expires and comes back as a full bucket, which is what it would have
//! refilled to anyway.

use super::bucket::{BucketParams, BucketRecord};
use super::{FailurePolicy, Limiter};
use crate::error::{ResilienceError, Result};
use async_trait::async_trait;
use bulwark_core_store::SharedStore;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Margin added to the record TTL beyond a full refill
const RECORD_TTL_MARGIN: Duration = Duration::from_secs(1);

/// Configuration for a distributed token bucket
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedLimiterConfig {
    /// Store key of the shared bucket
    pub key: String,
    /// Maximum tokens (burst allowance)
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Behaviour when the store is unreachable
    pub failure_policy: FailurePolicy,
    /// Delay reported by `reserve` while the store is unreachable under fail-closed
    pub unavailable_retry: Duration,
}

impl DistributedLimiterConfig {
    pub fn new(
        key: impl Into<String>,
        capacity: f64,
        refill_rate: f64,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            key: key.into(),
            capacity,
            refill_rate,
            failure_policy,
            unavailable_retry: Duration::from_secs(1),
        }
    }
}

/// Token bucket whose balance lives in a [`SharedStore`]
///
/// # Example
/// ```no_run
/// use bulwark::{DistributedLimiterConfig, DistributedTokenBucket, FailurePolicy, Limiter};
/// use bulwark::MemoryStore;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), bulwark::ResilienceError> {
/// let store = Arc::new(MemoryStore::new());
/// let config = DistributedLimiterConfig::new("ratelimit:search", 50.0, 10.0, FailurePolicy::FailOpen);
/// let limiter = DistributedTokenBucket::new(store, config)?;
///
/// if limiter.allow().await {
///     // admitted across every process sharing the store
/// }
/// # Ok(())
/// # }
/// ```
pub struct DistributedTokenBucket {
    store: Arc<dyn SharedStore>,
    config: DistributedLimiterConfig,
    params: BucketParams,
    record_ttl: Option<Duration>,
}

impl fmt::Debug for DistributedTokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedTokenBucket")
            .field("config", &self.config)
            .field("record_ttl", &self.record_ttl)
            .finish_non_exhaustive()
    }
}

impl DistributedTokenBucket {
    pub fn new(store: Arc<dyn SharedStore>, config: DistributedLimiterConfig) -> Result<Self> {
        if config.key.is_empty() {
            return Err(ResilienceError::InvalidConfig(
                "distributed limiter key must not be empty".to_string(),
            ));
        }
        let params = BucketParams::new(config.capacity, config.refill_rate)?;
        let record_ttl = params
            .time_to_full()
            .map(|full| full.saturating_add(RECORD_TTL_MARGIN));

        Ok(Self {
            store,
            config,
            params,
            record_ttl,
        })
    }

    pub fn key(&self) -> &str {
        &self.config.key
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.config.failure_policy
    }

    /// Take `n` tokens if available, propagating store failures
    pub async fn try_allow_n(&self, n: u32) -> Result<bool> {
        let now_ms = now_millis();
        let admitted = AtomicBool::new(false);

        let update = |current: Option<&[u8]>| -> Vec<u8> {
            let record = self.decode(current, now_ms).refilled(&self.params, now_ms);
            let (tokens, ok) = self.params.take(record.tokens, n);
            admitted.store(ok, Ordering::SeqCst);
            encode(&BucketRecord { tokens, ..record })
        };
        self.store
            .read_modify_write(&self.config.key, self.record_ttl, &update)
            .await?;

        let admitted = admitted.load(Ordering::SeqCst);
        tracing::debug!(key = %self.config.key, n, admitted, "distributed bucket admission");
        Ok(admitted)
    }

    /// Current shared balance, propagating store failures
    pub async fn try_tokens(&self) -> Result<f64> {
        Ok(self.snapshot().await?.tokens)
    }

    /// Time until `n` tokens are available, propagating store failures
    pub async fn try_reserve_n(&self, n: u32) -> Result<Duration> {
        let record = self.snapshot().await?;
        Ok(self.params.wait_time(record.tokens, n))
    }

    /// Read and project the record without writing it back
    async fn snapshot(&self) -> Result<BucketRecord> {
        let now_ms = now_millis();
        let current = self.store.get(&self.config.key).await?;
        Ok(self
            .decode(current.as_deref(), now_ms)
            .refilled(&self.params, now_ms))
    }

    fn decode(&self, current: Option<&[u8]>, now_ms: u64) -> BucketRecord {
        let Some(bytes) = current else {
            return BucketRecord::full(&self.params, now_ms);
        };
        match serde_json::from_slice::<BucketRecord>(bytes) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    key = %self.config.key,
                    error = %e,
                    "undecodable bucket record, starting from a full bucket"
                );
                BucketRecord::full(&self.params, now_ms)
            }
        }
    }

    fn log_unavailable(&self, error: &ResilienceError, operation: &str) {
        let action = match self.config.failure_policy {
            FailurePolicy::FailOpen => "admitting (fail-open)",
            FailurePolicy::FailClosed => "rejecting (fail-closed)",
        };
        tracing::warn!(
            key = %self.config.key,
            operation,
            error = %error,
            "rate limit store unavailable, {action}"
        );
    }
}

#[async_trait]
impl Limiter for DistributedTokenBucket {
    fn capacity(&self) -> f64 {
        self.params.capacity
    }

    async fn allow_n(&self, n: u32) -> bool {
        match self.try_allow_n(n).await {
            Ok(admitted) => admitted,
            Err(e) => {
                self.log_unavailable(&e, "allow");
                self.config.failure_policy == FailurePolicy::FailOpen
            }
        }
    }

    async fn reserve_n(&self, n: u32) -> Duration {
        match self.try_reserve_n(n).await {
            Ok(wait) => wait,
            Err(e) => {
                self.log_unavailable(&e, "reserve");
                match self.config.failure_policy {
                    FailurePolicy::FailOpen => Duration::ZERO,
                    FailurePolicy::FailClosed => self.config.unavailable_retry,
                }
            }
        }
    }

    async fn tokens(&self) -> f64 {
        match self.try_tokens().await {
            Ok(tokens) => tokens,
            Err(e) => {
                self.log_unavailable(&e, "tokens");
                match self.config.failure_policy {
                    FailurePolicy::FailOpen => self.params.capacity,
                    FailurePolicy::FailClosed => 0.0,
                }
            }
        }
    }
}

fn encode(record: &BucketRecord) -> Vec<u8> {
    // A record of two plain numbers always serializes; an empty value would
    // decode as a fresh bucket.
    serde_json::to_vec(record).unwrap_or_default()
}

/// Wall-clock milliseconds since the Unix epoch, shared across processes
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| u64::try_from(since.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core_store::testutil::FlakyStore;
    use bulwark_core_store::MemoryStore;

    fn limiter(store: Arc<dyn SharedStore>, policy: FailurePolicy) -> DistributedTokenBucket {
        DistributedTokenBucket::new(
            store,
            DistributedLimiterConfig::new("ratelimit:test", 10.0, 10.0, policy),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_burst_then_reject_then_refill() {
        let limiter = limiter(Arc::new(MemoryStore::new()), FailurePolicy::FailClosed);

        for _ in 0..10 {
            assert!(limiter.try_allow_n(1).await.unwrap());
        }
        assert!(!limiter.try_allow_n(1).await.unwrap());

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(limiter.try_allow_n(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_instances_share_one_bucket() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let a = limiter(Arc::clone(&store), FailurePolicy::FailClosed);
        let b = limiter(Arc::clone(&store), FailurePolicy::FailClosed);

        assert!(a.try_allow_n(6).await.unwrap());
        assert!(!b.try_allow_n(6).await.unwrap());
        assert!(b.try_allow_n(4).await.unwrap());
        assert!(a.try_tokens().await.unwrap() < 1.0);
    }

    #[tokio::test]
    async fn test_record_written_with_refill_ttl() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), FailurePolicy::FailClosed);
        assert_eq!(limiter.record_ttl, Some(Duration::from_secs(2)));

        limiter.try_allow_n(1).await.unwrap();
        let raw = store.get("ratelimit:test").await.unwrap().unwrap();
        let record: BucketRecord = serde_json::from_slice(&raw).unwrap();
        assert!(record.tokens <= 9.0 + 1e-6);
    }

    #[tokio::test]
    async fn test_corrupt_record_resets_to_full() {
        let store = Arc::new(MemoryStore::new());
        store
            .read_modify_write("ratelimit:test", None, &|_: Option<&[u8]>| b"garbage".to_vec())
            .await
            .unwrap();

        let limiter = limiter(store, FailurePolicy::FailClosed);
        assert!(limiter.try_allow_n(10).await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_open_admits_during_outage() {
        let store = Arc::new(FlakyStore::new());
        let limiter = limiter(store.clone(), FailurePolicy::FailOpen);
        store.set_offline(true);

        assert!(limiter.try_allow_n(1).await.is_err());
        assert!(limiter.allow().await);
        assert_eq!(limiter.reserve().await, Duration::ZERO);
        assert_eq!(limiter.tokens().await, 10.0);
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_during_outage() {
        let store = Arc::new(FlakyStore::new());
        let limiter = limiter(store.clone(), FailurePolicy::FailClosed);
        store.set_offline(true);

        assert!(!limiter.allow().await);
        assert_eq!(limiter.reserve().await, Duration::from_secs(1));
        assert_eq!(limiter.tokens().await, 0.0);

        store.set_offline(false);
        assert!(limiter.allow().await);
    }

    #[test]
    fn test_empty_key_rejected() {
        let config = DistributedLimiterConfig::new("", 1.0, 1.0, FailurePolicy::FailOpen);
        assert!(DistributedTokenBucket::new(Arc::new(MemoryStore::new()), config).is_err());
    }
}
