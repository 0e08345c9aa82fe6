//! Distributed mutual exclusion over a [`SharedStore`]
//!
//! A lock is one store record: `key -> owner_token`, written with a TTL. The
//! owner token is a fresh UUID per handle, and release/extend only act when
//! the stored value still equals it, so a handle whose lease expired can never
//! delete or prolong the record of whoever acquired the key after it.
//!
//! The TTL makes the lock best-effort: a holder that stalls longer than its
//! lease loses exclusivity without being told. Use [`DistributedLock::extend`]
//! for long critical sections.

use crate::error::{ResilienceError, Result};
use crate::retry::{sleep_or_cancel, RetryPolicy};
use bulwark_core_store::{MemoryStore, SharedStore, StoreError};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default prefix put in front of every lock key
pub const DEFAULT_KEY_PREFIX: &str = "lock:";

/// Factory for lock handles sharing one store and key namespace
///
/// # Example
/// ```no_run
/// use bulwark::Locker;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), bulwark::ResilienceError> {
/// let locker = Locker::in_memory();
/// let cancel = CancellationToken::new();
///
/// let outcome = locker
///     .with_lock(&cancel, "nightly-report", Duration::from_secs(30), || async {
///         // only one process runs this at a time
///         Ok(())
///     })
///     .await?;
///
/// if outcome.is_none() {
///     println!("another worker holds the lock");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Locker {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    retry: RetryPolicy,
}

impl fmt::Debug for Locker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locker")
            .field("key_prefix", &self.key_prefix)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Locker {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    /// Locker over a process-local [`MemoryStore`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Policy used by [`Locker::with_lock`] to acquire
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Create an unacquired handle with its own owner token
    pub fn new_lock(&self, key: &str, ttl: Duration) -> Result<DistributedLock> {
        if key.is_empty() {
            return Err(ResilienceError::InvalidConfig(
                "lock key must not be empty".to_string(),
            ));
        }
        if ttl.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "lock ttl must be > 0".to_string(),
            ));
        }

        Ok(DistributedLock {
            store: Arc::clone(&self.store),
            key: format!("{}{}", self.key_prefix, key),
            owner_token: Uuid::new_v4().to_string(),
            ttl,
            held: AtomicBool::new(false),
        })
    }

    /// Run `op` while holding the lock on `key`
    ///
    /// Returns `Ok(None)` without running `op` when the lock could not be
    /// obtained within the locker's retry policy. Release is attempted after
    /// `op` whatever its outcome; a failed release is logged and left to TTL
    /// expiry.
    pub async fn with_lock<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        ttl: Duration,
        op: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.new_lock(key, ttl)?;
        if !lock.acquire_with_retry(cancel, &self.retry).await? {
            return Ok(None);
        }

        let result = op().await;

        // The caller's token may already be cancelled; release regardless.
        if let Err(e) = lock.release(&CancellationToken::new()).await {
            tracing::warn!(
                key = %lock.key,
                error = %e,
                "lock release failed, record left to expire"
            );
        }

        result.map(Some)
    }
}

/// One attempt at holding a named lock
///
/// Each handle carries a unique owner token. Dropping a held handle does not
/// release it; the record expires after its TTL.
pub struct DistributedLock {
    store: Arc<dyn SharedStore>,
    key: String,
    owner_token: String,
    ttl: Duration,
    held: AtomicBool,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("owner_token", &self.owner_token)
            .field("ttl", &self.ttl)
            .field("held", &self.is_held())
            .finish_non_exhaustive()
    }
}

impl DistributedLock {
    /// Full store key, including the locker's prefix
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner_token(&self) -> &str {
        &self.owner_token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether this handle believes it holds the lock
    ///
    /// The belief can be stale: the lease may have expired since the last
    /// successful acquire or extend.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Try once to take the lock
    ///
    /// Returns `Ok(false)` when another owner holds it. A handle that already
    /// holds the lock refreshes its lease instead; if that lease has lapsed,
    /// the key is contested like any fresh acquire.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<bool> {
        if self.is_held() {
            let refreshed = cancellable(
                cancel,
                self.store
                    .compare_and_extend(&self.key, self.owner_token.as_bytes(), self.ttl),
            )
            .await?;
            if refreshed {
                tracing::debug!(key = %self.key, "lock lease refreshed");
                return Ok(true);
            }
            self.held.store(false, Ordering::SeqCst);
            tracing::debug!(key = %self.key, "own lease lapsed, contending again");
        }

        let acquired = cancellable(
            cancel,
            self.store
                .set_if_absent(&self.key, self.owner_token.as_bytes(), self.ttl),
        )
        .await?;

        self.held.store(acquired, Ordering::SeqCst);
        tracing::debug!(key = %self.key, acquired, "lock acquire");
        Ok(acquired)
    }

    /// Acquire with bounded retries
    ///
    /// Contention and transient store errors are retried with the policy's
    /// backoff. Returns `Ok(false)` once attempts run out while the lock is
    /// taken, or the last store error if the final attempt failed.
    pub async fn acquire_with_retry(
        &self,
        cancel: &CancellationToken,
        policy: &RetryPolicy,
    ) -> Result<bool> {
        policy.validate()?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let last = attempt >= policy.max_attempts;

            match self.acquire(cancel).await {
                Ok(true) => return Ok(true),
                Ok(false) if last => return Ok(false),
                Ok(false) => {
                    tracing::debug!(key = %self.key, attempt, "lock contended, retrying");
                }
                Err(e) if last || !e.is_transient() => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        key = %self.key,
                        attempt,
                        error = %e,
                        "lock acquire failed, retrying"
                    );
                }
            }

            sleep_or_cancel(cancel, policy.delay_for(attempt)).await?;
        }
    }

    /// Give the lock up if this handle still owns it
    ///
    /// Releasing a lock that expired or passed to another owner deletes
    /// nothing and is not an error.
    pub async fn release(&self, cancel: &CancellationToken) -> Result<()> {
        let deleted = cancellable(
            cancel,
            self.store
                .compare_and_delete(&self.key, self.owner_token.as_bytes()),
        )
        .await?;

        if deleted {
            tracing::debug!(key = %self.key, "lock released");
        } else {
            tracing::warn!(key = %self.key, "lock release skipped, no longer the owner");
        }
        self.held.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Reset the lease to `ttl` from now
    ///
    /// Fails with [`ResilienceError::LockNotHeld`] when the record expired or
    /// belongs to another owner.
    pub async fn extend(&self, cancel: &CancellationToken, ttl: Duration) -> Result<()> {
        if ttl.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "lock ttl must be > 0".to_string(),
            ));
        }

        let extended = cancellable(
            cancel,
            self.store
                .compare_and_extend(&self.key, self.owner_token.as_bytes(), ttl),
        )
        .await?;

        if !extended {
            self.held.store(false, Ordering::SeqCst);
            tracing::warn!(key = %self.key, "lock extend refused, no longer the owner");
            return Err(ResilienceError::LockNotHeld(self.key.clone()));
        }

        self.held.store(true, Ordering::SeqCst);
        tracing::debug!(key = %self.key, ?ttl, "lock extended");
        Ok(())
    }
}

/// Race a store call against cancellation
async fn cancellable<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = std::result::Result<T, StoreError>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ResilienceError::Cancelled),
        result = call => Ok(result?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core_store::testutil::FlakyStore;

    fn ttl() -> Duration {
        Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_second_handle_is_excluded() {
        let locker = Locker::in_memory();
        let cancel = CancellationToken::new();
        let a = locker.new_lock("jobs", ttl()).unwrap();
        let b = locker.new_lock("jobs", ttl()).unwrap();

        assert!(a.acquire(&cancel).await.unwrap());
        assert!(!b.acquire(&cancel).await.unwrap());
        assert!(a.is_held());
        assert!(!b.is_held());

        a.release(&cancel).await.unwrap();
        assert!(!a.is_held());
        assert!(b.acquire(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_prefixed() {
        let locker = Locker::in_memory().with_key_prefix("app:lock:");
        let lock = locker.new_lock("jobs", ttl()).unwrap();
        assert_eq!(lock.key(), "app:lock:jobs");

        lock.acquire(&CancellationToken::new()).await.unwrap();
        let stored = locker.store().get("app:lock:jobs").await.unwrap();
        assert_eq!(stored.as_deref(), Some(lock.owner_token().as_bytes()));
    }

    #[tokio::test]
    async fn test_owner_tokens_are_unique() {
        let locker = Locker::in_memory();
        let a = locker.new_lock("jobs", ttl()).unwrap();
        let b = locker.new_lock("jobs", ttl()).unwrap();
        assert_ne!(a.owner_token(), b.owner_token());
    }

    #[tokio::test]
    async fn test_reacquire_refreshes_own_lease() {
        let locker = Locker::in_memory();
        let cancel = CancellationToken::new();
        let lock = locker.new_lock("jobs", ttl()).unwrap();

        assert!(lock.acquire(&cancel).await.unwrap());
        assert!(lock.acquire(&cancel).await.unwrap());
        assert!(lock.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_after_own_lease_expired() {
        let locker = Locker::in_memory();
        let cancel = CancellationToken::new();
        let lock = locker.new_lock("jobs", Duration::from_millis(50)).unwrap();

        assert!(lock.acquire(&cancel).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(locker.store().get("lock:jobs").await.unwrap(), None);

        // Still believes it holds the key, but nobody does
        assert!(lock.is_held());
        assert!(lock.acquire(&cancel).await.unwrap());
        assert!(lock.is_held());
        let stored = locker.store().get("lock:jobs").await.unwrap();
        assert_eq!(stored.as_deref(), Some(lock.owner_token().as_bytes()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reacquire_after_expiry_loses_to_new_owner() {
        let locker = Locker::in_memory();
        let cancel = CancellationToken::new();
        let stale = locker.new_lock("jobs", Duration::from_millis(50)).unwrap();
        let fresh = locker.new_lock("jobs", ttl()).unwrap();

        assert!(stale.acquire(&cancel).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fresh.acquire(&cancel).await.unwrap());

        assert!(!stale.acquire(&cancel).await.unwrap());
        assert!(!stale.is_held());
    }

    #[tokio::test]
    async fn test_extend_by_non_owner_fails() {
        let locker = Locker::in_memory();
        let cancel = CancellationToken::new();
        let lock = locker.new_lock("jobs", ttl()).unwrap();

        let result = lock.extend(&cancel, ttl()).await;
        assert_eq!(
            result,
            Err(ResilienceError::LockNotHeld("lock:jobs".to_string()))
        );
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_store_outage_leaves_belief_unchanged() {
        let store = Arc::new(FlakyStore::new());
        let locker = Locker::new(store.clone());
        let cancel = CancellationToken::new();
        let lock = locker.new_lock("jobs", ttl()).unwrap();

        assert!(lock.acquire(&cancel).await.unwrap());
        store.set_offline(true);

        assert!(matches!(
            lock.release(&cancel).await,
            Err(ResilienceError::Store(StoreError::Unavailable(_)))
        ));
        assert!(lock.is_held());
        assert!(lock.extend(&cancel, ttl()).await.is_err());
        assert!(lock.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_retry_gives_up() {
        let locker = Locker::in_memory();
        let cancel = CancellationToken::new();
        let holder = locker.new_lock("jobs", ttl()).unwrap();
        let waiter = locker.new_lock("jobs", ttl()).unwrap();
        assert!(holder.acquire(&cancel).await.unwrap());

        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        assert!(!waiter.acquire_with_retry(&cancel, &policy).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_retry_wins_after_expiry() {
        let locker = Locker::in_memory();
        let cancel = CancellationToken::new();
        let holder = locker.new_lock("jobs", Duration::from_millis(30)).unwrap();
        let waiter = locker.new_lock("jobs", ttl()).unwrap();
        assert!(holder.acquire(&cancel).await.unwrap());

        let policy = RetryPolicy::fixed(5, Duration::from_millis(20));
        assert!(waiter.acquire_with_retry(&cancel, &policy).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_with_slow_store() {
        let store = Arc::new(FlakyStore::new());
        store.set_latency(Some(Duration::from_secs(10)));
        let locker = Locker::new(store);
        let lock = locker.new_lock("jobs", ttl()).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        assert_eq!(lock.acquire(&cancel).await, Err(ResilienceError::Cancelled));
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_with_lock_runs_and_releases() {
        let locker = Locker::in_memory();
        let cancel = CancellationToken::new();

        let value = locker
            .with_lock(&cancel, "jobs", ttl(), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, Some(7));
        assert_eq!(locker.store().get("lock:jobs").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_skips_when_contended() {
        let locker =
            Locker::in_memory().with_retry_policy(RetryPolicy::fixed(2, Duration::from_millis(5)));
        let cancel = CancellationToken::new();
        let holder = locker.new_lock("jobs", ttl()).unwrap();
        assert!(holder.acquire(&cancel).await.unwrap());

        let value = locker
            .with_lock(&cancel, "jobs", ttl(), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_new_lock_validates() {
        let locker = Locker::in_memory();
        assert!(locker.new_lock("", ttl()).is_err());
        assert!(locker.new_lock("jobs", Duration::ZERO).is_err());
    }
}
