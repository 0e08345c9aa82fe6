//! Fault injection for tests of store-backed primitives
//!
//! [`FlakyStore`] wraps a [`MemoryStore`] and can be switched offline (every
//! call fails with [`StoreError::Unavailable`]) or slowed down with an
//! artificial per-call latency.

use crate::{MemoryStore, Result, SharedStore, StoreError, UpdateFn};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Total calls received, including failed ones
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The wrapped store, for inspecting state behind the fault layer
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    async fn gate(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.gate().await?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.gate().await?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        self.gate().await?;
        self.inner.compare_and_extend(key, expected, ttl).await
    }

    async fn read_modify_write(
        &self,
        key: &str,
        ttl: Option<Duration>,
        f: &UpdateFn<'_>,
    ) -> Result<Vec<u8>> {
        self.gate().await?;
        self.inner.read_modify_write(key, ttl, f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_store_fails_and_recovers() {
        let store = FlakyStore::new();
        store.set_offline(true);

        let err = store.get("k").await.unwrap_err();
        assert!(err.is_transient());

        store.set_offline(false);
        assert!(store
            .set_if_absent("k", b"v", Duration::from_secs(1))
            .await
            .unwrap());
        assert_eq!(store.calls(), 2);
        assert_eq!(store.inner().len(), 1);
    }
}
