//! In-memory implementation of KvStore for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;

use super::kv::{KvStore, StoreError};
use crate::clock::{Clock, SharedClock, SystemClock};

/// Internal entry state
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-memory implementation of KvStore
///
/// This is primarily for testing. Keys are kept in lexicographic order, which
/// is also the order `list` returns them in, matching remote KV namespaces.
/// TTL expiry is evaluated lazily against the injected clock.
///
/// Fault switches let tests simulate a degraded store:
/// - [`fail_list`](Self::fail_list): every `list` call fails
/// - [`fail_reads`](Self::fail_reads): every `get` call fails
/// - [`fail_writes`](Self::fail_writes): every `put` and `delete` call fails
///
/// # Example
///
/// ```
/// use taskrelay_queue::store::InMemoryKvStore;
///
/// let store = InMemoryKvStore::new();
/// assert_eq!(store.list_calls(), 0);
/// ```
pub struct InMemoryKvStore {
    entries: RwLock<BTreeMap<String, Entry>>,
    clock: SharedClock,
    fail_list: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    list_calls: RwLock<HashMap<String, usize>>,
    put_calls: AtomicUsize,
}

impl InMemoryKvStore {
    /// Create a new in-memory store using the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose TTLs are evaluated against `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            clock,
            fail_list: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            list_calls: RwLock::new(HashMap::new()),
            put_calls: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent `list` call fail (or succeed again)
    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `get` call fail (or succeed again)
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `put`/`delete` call fail (or succeed again)
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Total number of `list` calls, successful or not
    pub fn list_calls(&self) -> usize {
        self.list_calls.read().values().sum()
    }

    /// Number of `list` calls made with exactly `prefix`
    pub fn list_calls_for(&self, prefix: &str) -> usize {
        self.list_calls.read().get(prefix).copied().unwrap_or(0)
    }

    /// Total number of `put` calls, successful or not
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Reset all call counters
    pub fn reset_counters(&self) {
        self.list_calls.write().clear();
        self.put_calls.store(0, Ordering::SeqCst);
    }

    /// Whether a live value exists under `key`
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .read()
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Remaining TTL of a live key, if it has one
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .read()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .and_then(|at| (at - now).to_std().ok())
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    /// Whether the store holds no live keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }

        let now = self.clock.now();
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }

        let expires_at = match ttl {
            Some(ttl) => Some(
                self.clock.now()
                    + ChronoDuration::from_std(ttl)
                        .map_err(|e| StoreError::Serialization(format!("invalid ttl: {e}")))?,
            ),
            None => None,
        };

        self.entries
            .write()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }

        self.entries.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        *self
            .list_calls
            .write()
            .entry(prefix.to_string())
            .or_insert(0) += 1;

        if self.fail_list.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected list failure".to_string()));
        }

        let now = self.clock.now();
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryKvStore::new();

        store.put("a", "1".to_string(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);

        // Deleting again is fine
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let clock = ManualClock::default();
        let store = InMemoryKvStore::with_clock(Arc::new(clock.clone()));

        store
            .put("k", "v".to_string(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(59));
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.list("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_by_prefix_in_order() {
        let store = InMemoryKvStore::new();
        for key in ["task:b", "lease:a", "task:a", "task-index", "task:c"] {
            store.put(key, "{}".to_string(), None).await.unwrap();
        }

        let keys = store.list("task:").await.unwrap();
        assert_eq!(keys, vec!["task:a", "task:b", "task:c"]);
        assert_eq!(store.list_calls_for("task:"), 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = InMemoryKvStore::new();
        store.fail_list(true);
        store.fail_reads(true);
        store.fail_writes(true);

        assert!(store.list("x").await.is_err());
        assert!(store.get("x").await.is_err());
        assert!(store.put("x", String::new(), None).await.is_err());
        assert!(store.delete("x").await.is_err());

        // Failed calls still count
        assert_eq!(store.list_calls(), 1);
        assert_eq!(store.put_calls(), 1);
    }
}
