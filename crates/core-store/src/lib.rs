//! Bulwark Core Store: the storage contract behind the distributed primitives
//!
//! The distributed rate limiter and the distributed lock never talk to a
//! database directly. They consume the [`SharedStore`] trait, a deliberately
//! narrow set of atomic operations:
//!
//! 1. **Lookup**: `get`
//! 2. **Conditional writes**: `set_if_absent`, `compare_and_delete`, `compare_and_extend`
//! 3. **Atomic update**: `read_modify_write`
//!
//! How an implementation achieves atomicity (a scripting engine, a
//! compare-and-swap loop, a transaction, or a process-local mutex) is its own
//! business. [`MemoryStore`] is the single-node implementation shipped here.
//!
//! # Example
//!
//! ```rust,no_run
//! use bulwark_core_store::{MemoryStore, SharedStore};
//! use std::time::Duration;
//!
//! # async fn example() -> bulwark_core_store::Result<()> {
//! let store = MemoryStore::new();
//!
//! // First writer wins
//! assert!(store.set_if_absent("lock:jobs", b"owner-a", Duration::from_secs(5)).await?);
//! assert!(!store.set_if_absent("lock:jobs", b"owner-b", Duration::from_secs(5)).await?);
//!
//! // Only the recorded owner may delete
//! assert!(!store.compare_and_delete("lock:jobs", b"owner-b").await?);
//! assert!(store.compare_and_delete("lock:jobs", b"owner-a").await?);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use memory::MemoryStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Connectivity problems are worth retrying; backend errors are not
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Update function handed to [`SharedStore::read_modify_write`].
///
/// Receives the current value (`None` if absent or expired) and returns the
/// value to store.
pub type UpdateFn<'a> = dyn Fn(Option<&[u8]>) -> Vec<u8> + Send + Sync + 'a;

/// Key-value store offering the atomic conditional operations the
/// distributed primitives are built on.
///
/// Implementations must be `Send + Sync + 'static` so a single store can be
/// shared (`Arc<dyn SharedStore>`) across tasks, limiters and lockers.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Read the live value for `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key` with `ttl` only if no live value exists.
    ///
    /// Returns `true` if the value was written.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete `key` only if its live value equals `expected`.
    ///
    /// Returns `true` if a record was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Reset the expiry of `key` to `ttl` from now, only if its live value
    /// equals `expected`.
    ///
    /// Returns `true` if the expiry was updated.
    async fn compare_and_extend(&self, key: &str, expected: &[u8], ttl: Duration)
        -> Result<bool>;

    /// Atomically replace the value of `key` with `f(current)`.
    ///
    /// `f` may be invoked more than once (for example by a compare-and-swap
    /// retry loop); the value returned by the final invocation is the one
    /// written and returned. `ttl` of `None` stores the value without expiry.
    async fn read_modify_write(
        &self,
        key: &str,
        ttl: Option<Duration>,
        f: &UpdateFn<'_>,
    ) -> Result<Vec<u8>>;
}
