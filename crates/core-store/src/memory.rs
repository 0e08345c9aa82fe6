//! In-process [`SharedStore`] backed by a mutex-guarded map
//!
//! Suitable for single-node deployments and tests. Expiry is lazy: a record
//! past its deadline is treated as absent by every operation and removed the
//! next time its key is touched, or in bulk by [`MemoryStore::purge_expired`].

use crate::{Result, SharedStore, UpdateFn};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Vec<u8>, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// Single-node shared store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Whether the store holds no live records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired record, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "purged expired store records");
        }
        removed
    }

    /// Look up a live entry, evicting it if it has expired
    fn live_entry<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(Self::live_entry(&mut entries, key, now).map(|entry| entry.value.clone()))
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if Self::live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(value.to_vec(), Some(ttl), now));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key, now) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match Self::live_entry(&mut entries, key, now) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn read_modify_write(
        &self,
        key: &str,
        ttl: Option<Duration>,
        f: &UpdateFn<'_>,
    ) -> Result<Vec<u8>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let current = Self::live_entry(&mut entries, key, now).map(|entry| entry.value.as_slice());
        let updated = f(current);
        entries.insert(key.to_string(), Entry::new(updated.clone(), ttl, now));
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_if_absent_first_writer_wins() {
        let store = MemoryStore::new();

        assert!(store
            .set_if_absent("k", b"a", Duration::from_secs(1))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("k", b"b", Duration::from_secs(1))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_is_absent() {
        let store = MemoryStore::new();
        store
            .set_if_absent("k", b"a", Duration::from_millis(50))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store
            .set_if_absent("k", b"b", Duration::from_millis(50))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn test_compare_and_delete_requires_match() {
        let store = MemoryStore::new();
        store
            .set_if_absent("k", b"owner", Duration::from_secs(1))
            .await
            .unwrap();

        assert!(!store.compare_and_delete("k", b"intruder").await.unwrap());
        assert!(store.get("k").await.unwrap().is_some());

        assert!(store.compare_and_delete("k", b"owner").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.compare_and_delete("missing", b"owner").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_extend_pushes_deadline() {
        let store = MemoryStore::new();
        store
            .set_if_absent("k", b"owner", Duration::from_millis(100))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store
            .compare_and_extend("k", b"owner", Duration::from_millis(100))
            .await
            .unwrap());
        assert!(!store
            .compare_and_extend("k", b"intruder", Duration::from_millis(500))
            .await
            .unwrap());

        // Past the original deadline, inside the extended one
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(b"owner".to_vec()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_modify_write_sees_current_value() {
        let store = MemoryStore::new();
        let bump = |current: Option<&[u8]>| {
            let n = current.map_or(0, |bytes| bytes[0]);
            vec![n + 1]
        };

        assert_eq!(store.read_modify_write("n", None, &bump).await.unwrap(), vec![1]);
        assert_eq!(store.read_modify_write("n", None, &bump).await.unwrap(), vec![2]);
        assert_eq!(store.get("n").await.unwrap(), Some(vec![2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store
            .set_if_absent("short", b"x", Duration::from_millis(10))
            .await
            .unwrap();
        store
            .set_if_absent("long", b"y", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.len(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_expired(), 1);
        assert!(!store.is_empty());
    }
}
