//! Task index cache
//!
//! Keeps one snapshot of pending task ids under `task-index` so that polling
//! workers do not enumerate the task namespace on every poll.
//!
//! ```text
//! read():
//!   snapshot age < freshness           -> snapshot              (fresh)
//!   list(task:) ok                     -> new snapshot          (refreshed)
//!   list fails, age < tolerance        -> last good snapshot    (stale, warn)
//!   list fails, no usable snapshot     -> []                    (failed, error)
//! ```
//!
//! The snapshot lags the true set of task keys: new tasks can stay invisible
//! for up to one freshness window, and under a failing `list` for up to the
//! staleness tolerance. Past that the snapshot is never served.
//!
//! Invalidation is remembered locally as well: a stored snapshot taken at or
//! before the last `invalidate()` is ignored even if deleting it failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, trace, warn};

use crate::clock::SharedClock;
use crate::config::QueueConfig;
use crate::keys::KeySpace;
use crate::metrics;
use crate::model::TaskId;
use crate::store::{get_json, put_json, KvStore, StoreError};

/// Cached enumeration of pending task ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSnapshot {
    pub ids: Vec<TaskId>,
    pub cached_at: DateTime<Utc>,
}

impl IndexSnapshot {
    fn age(&self, now: DateTime<Utc>) -> Duration {
        // Clock skew between workers can put cached_at in the future
        (now - self.cached_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Where the ids returned by a read came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Snapshot within the freshness window
    Fresh,
    /// New snapshot from a successful `list`
    Refreshed,
    /// Listing failed, snapshot within the staleness tolerance
    Stale,
    /// Listing failed and no usable snapshot exists
    Failed,
}

impl ReadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Refreshed => "refreshed",
            Self::Stale => "stale",
            Self::Failed => "failed",
        }
    }
}

/// Result of [`TaskIndexCache::read_detailed`]
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRead {
    pub ids: Vec<TaskId>,
    pub source: ReadSource,
    /// Age of the served snapshot (zero when just refreshed)
    pub age: Duration,
}

/// Bounded-staleness cache of pending task ids
pub struct TaskIndexCache {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    clock: SharedClock,
    freshness: Duration,
    staleness_tolerance: Duration,
    snapshot_ttl: Duration,
    /// Last good snapshot seen by this process, for when the store is unreachable
    last_good: RwLock<Option<IndexSnapshot>>,
    /// Set by `invalidate()`, cleared once this process persists a newer snapshot
    invalidated_at: RwLock<Option<DateTime<Utc>>>,
    reads: Counter<u64>,
    list_calls: Counter<u64>,
}

impl TaskIndexCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        keys: KeySpace,
        config: &QueueConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            keys,
            clock,
            freshness: config.index_freshness,
            staleness_tolerance: config.index_staleness_tolerance,
            snapshot_ttl: config.index_snapshot_ttl(),
            last_good: RwLock::new(None),
            invalidated_at: RwLock::new(None),
            reads: metrics::index_reads(),
            list_calls: metrics::list_calls(),
        }
    }

    /// Pending task ids in store order. Never fails; see [`read_detailed`](Self::read_detailed).
    pub async fn read(&self) -> Vec<TaskId> {
        self.read_detailed().await.ids
    }

    /// Pending task ids together with where they came from
    #[instrument(skip(self))]
    pub async fn read_detailed(&self) -> IndexRead {
        let now = self.clock.now();
        let index_key = self.keys.index_key();
        let invalidated_at = *self.invalidated_at.read();

        let stored = match get_json::<IndexSnapshot>(self.store.as_ref(), &index_key).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Failed to read index snapshot, treating as missing");
                None
            }
        };
        let stored = stored.filter(|snapshot| match invalidated_at {
            Some(at) if snapshot.cached_at <= at => {
                debug!("Ignoring stored index snapshot taken before invalidation");
                false
            }
            _ => true,
        });

        if let Some(snapshot) = &stored {
            let age = snapshot.age(now);
            if age < self.freshness {
                trace!(age_secs = age.as_secs(), count = snapshot.ids.len(), "Serving fresh index");
                self.remember(snapshot.clone());
                return self.finish(snapshot.ids.clone(), ReadSource::Fresh, age);
            }
        }

        self.list_calls
            .add(1, &[KeyValue::new("namespace", "task")]);
        match self.store.list(&self.keys.task_prefix()).await {
            Ok(keys) => {
                let ids: Vec<TaskId> = keys
                    .iter()
                    .filter_map(|key| self.keys.task_id_from_key(key))
                    .collect();
                let snapshot = IndexSnapshot {
                    ids: ids.clone(),
                    cached_at: now,
                };

                match put_json(
                    self.store.as_ref(),
                    &index_key,
                    &snapshot,
                    Some(self.snapshot_ttl),
                )
                .await
                {
                    Ok(()) => self.clear_invalidation(invalidated_at),
                    Err(e) => warn!(error = %e, "Failed to persist index snapshot"),
                }

                debug!(count = ids.len(), "Refreshed task index");
                self.remember(snapshot);
                self.finish(ids, ReadSource::Refreshed, Duration::ZERO)
            }
            Err(e) => self.fall_back(stored, now, e),
        }
    }

    fn fall_back(
        &self,
        stored: Option<IndexSnapshot>,
        now: DateTime<Utc>,
        cause: StoreError,
    ) -> IndexRead {
        let local = self.last_good.read().clone();
        let candidate = match (stored, local) {
            (Some(a), Some(b)) => Some(if a.cached_at >= b.cached_at { a } else { b }),
            (a, b) => a.or(b),
        };

        match candidate {
            Some(snapshot) if snapshot.age(now) < self.staleness_tolerance => {
                let age = snapshot.age(now);
                warn!(
                    error = %cause,
                    age_secs = age.as_secs(),
                    count = snapshot.ids.len(),
                    "Task listing failed, serving stale index"
                );
                self.finish(snapshot.ids, ReadSource::Stale, age)
            }
            Some(snapshot) => {
                let age = snapshot.age(now);
                error!(
                    error = %cause,
                    age_secs = age.as_secs(),
                    tolerance_secs = self.staleness_tolerance.as_secs(),
                    "Task listing failed and index is past staleness tolerance, reporting nothing pending"
                );
                self.finish(Vec::new(), ReadSource::Failed, age)
            }
            None => {
                error!(error = %cause, "Task listing failed with no index snapshot, reporting nothing pending");
                self.finish(Vec::new(), ReadSource::Failed, Duration::ZERO)
            }
        }
    }

    fn finish(&self, ids: Vec<TaskId>, source: ReadSource, age: Duration) -> IndexRead {
        self.reads
            .add(1, &[KeyValue::new("source", source.as_str())]);
        IndexRead { ids, source, age }
    }

    /// The stored snapshot now postdates the invalidation seen at the start of
    /// the read. A newer `invalidate()` that raced the refresh stays in force.
    fn clear_invalidation(&self, observed: Option<DateTime<Utc>>) {
        let mut invalidated_at = self.invalidated_at.write();
        if *invalidated_at == observed {
            *invalidated_at = None;
        }
    }

    fn remember(&self, snapshot: IndexSnapshot) {
        let mut last_good = self.last_good.write();
        let newer = last_good
            .as_ref()
            .map_or(true, |current| snapshot.cached_at >= current.cached_at);
        if newer {
            *last_good = Some(snapshot);
        }
    }

    /// Drop the snapshot so the next read lists again
    ///
    /// The in-process copy is cleared and the invalidation time recorded
    /// before the store delete, so this process never serves the invalidated
    /// ids even when the delete fails.
    #[instrument(skip(self))]
    pub async fn invalidate(&self) -> Result<(), StoreError> {
        self.last_good.write().take();
        *self.invalidated_at.write() = Some(self.clock.now());
        self.store.delete(&self.keys.index_key()).await?;
        debug!("Invalidated task index");
        Ok(())
    }

    /// Called after every enqueue. Intentionally does nothing.
    ///
    /// Updating the snapshot here would add a store write to every producer
    /// call. New tasks become visible on the next refresh instead.
    pub fn on_enqueue(&self, id: &TaskId) {
        trace!(task_id = %id, "Task enqueued, index refresh deferred");
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    pub fn staleness_tolerance(&self) -> Duration {
        self.staleness_tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryKvStore;

    fn setup() -> (Arc<InMemoryKvStore>, ManualClock, TaskIndexCache) {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryKvStore::with_clock(Arc::new(clock.clone())));
        let cache = TaskIndexCache::new(
            store.clone(),
            KeySpace::default(),
            &QueueConfig::default(),
            Arc::new(clock.clone()),
        );
        (store, clock, cache)
    }

    async fn seed(store: &InMemoryKvStore, ids: &[&str]) {
        for id in ids {
            store
                .put(&format!("task:{id}"), "{}".to_string(), None)
                .await
                .unwrap();
        }
    }

    fn ids(raw: &[&str]) -> Vec<TaskId> {
        raw.iter().map(|id| TaskId::from_stored(id)).collect()
    }

    #[tokio::test]
    async fn test_fresh_reads_list_once() {
        let (store, _clock, cache) = setup();
        seed(&store, &["task1", "task2", "task3"]).await;

        let first = cache.read_detailed().await;
        let second = cache.read_detailed().await;

        assert_eq!(first.source, ReadSource::Refreshed);
        assert_eq!(second.source, ReadSource::Fresh);
        assert_eq!(first.ids, second.ids);
        assert_eq!(first.ids, ids(&["task1", "task2", "task3"]));
        assert_eq!(store.list_calls_for("task:"), 1);
    }

    #[tokio::test]
    async fn test_new_task_invisible_until_refresh() {
        let (store, clock, cache) = setup();
        seed(&store, &["task1"]).await;
        cache.read().await;

        seed(&store, &["task2"]).await;
        cache.on_enqueue(&TaskId::from_stored("task2"));
        assert_eq!(cache.read().await, ids(&["task1"]));

        clock.advance(Duration::from_secs(300));
        assert_eq!(cache.read().await, ids(&["task1", "task2"]));
        assert_eq!(store.list_calls_for("task:"), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_list() {
        let (store, _clock, cache) = setup();
        seed(&store, &["task1", "task2"]).await;
        cache.read().await;

        store.delete("task:task1").await.unwrap();
        cache.invalidate().await.unwrap();

        let read = cache.read_detailed().await;
        assert_eq!(read.source, ReadSource::Refreshed);
        assert_eq!(read.ids, ids(&["task2"]));
        assert_eq!(store.list_calls_for("task:"), 2);
    }

    #[tokio::test]
    async fn test_invalidate_holds_when_store_delete_fails() {
        let (store, _clock, cache) = setup();
        seed(&store, &["task1", "task2"]).await;
        cache.read().await;

        store.delete("task:task1").await.unwrap();
        store.fail_writes(true);
        assert!(cache.invalidate().await.is_err());
        store.fail_writes(false);
        assert!(store.contains("task-index"));

        let read = cache.read_detailed().await;
        assert_eq!(read.source, ReadSource::Refreshed);
        assert_eq!(read.ids, ids(&["task2"]));
        assert_eq!(store.list_calls_for("task:"), 2);

        // The refreshed snapshot was persisted, so the next read is served from it
        assert_eq!(cache.read_detailed().await.source, ReadSource::Fresh);
        assert_eq!(store.list_calls_for("task:"), 2);
    }

    #[tokio::test]
    async fn test_stale_snapshot_within_tolerance() {
        let (store, clock, cache) = setup();
        seed(&store, &["task1", "task2"]).await;
        cache.read().await;

        clock.advance(Duration::from_secs(20 * 60));
        store.fail_list(true);

        let read = cache.read_detailed().await;
        assert_eq!(read.source, ReadSource::Stale);
        assert_eq!(read.ids, ids(&["task1", "task2"]));
        assert_eq!(read.age, Duration::from_secs(20 * 60));
    }

    #[tokio::test]
    async fn test_snapshot_past_tolerance_fails_closed() {
        let (store, clock, cache) = setup();
        seed(&store, &["task1", "task2"]).await;
        cache.read().await;

        clock.advance(Duration::from_secs(35 * 60));
        store.fail_list(true);

        let read = cache.read_detailed().await;
        assert_eq!(read.source, ReadSource::Failed);
        assert!(read.ids.is_empty());
    }

    #[tokio::test]
    async fn test_no_snapshot_fails_closed() {
        let (store, _clock, cache) = setup();
        seed(&store, &["task1"]).await;
        store.fail_list(true);

        let read = cache.read_detailed().await;
        assert_eq!(read.source, ReadSource::Failed);
        assert!(read.ids.is_empty());
    }

    #[tokio::test]
    async fn test_local_snapshot_covers_unreachable_store() {
        let (store, clock, cache) = setup();
        seed(&store, &["task1"]).await;
        cache.read().await;

        clock.advance(Duration::from_secs(10 * 60));
        store.fail_reads(true);
        store.fail_list(true);

        let read = cache.read_detailed().await;
        assert_eq!(read.source, ReadSource::Stale);
        assert_eq!(read.ids, ids(&["task1"]));
    }

    #[tokio::test]
    async fn test_snapshot_written_by_other_worker_is_shared() {
        let (store, _clock, cache) = setup();
        seed(&store, &["task1"]).await;
        cache.read().await;

        let clock = ManualClock::default();
        let other = TaskIndexCache::new(
            store.clone(),
            KeySpace::default(),
            &QueueConfig::default(),
            Arc::new(clock),
        );
        assert_eq!(other.read_detailed().await.source, ReadSource::Fresh);
        assert_eq!(store.list_calls_for("task:"), 1);
    }

    #[tokio::test]
    async fn test_snapshot_write_failure_does_not_fail_read() {
        let (store, _clock, cache) = setup();
        seed(&store, &["task1"]).await;
        store.fail_writes(true);

        let read = cache.read_detailed().await;
        assert_eq!(read.source, ReadSource::Refreshed);
        assert_eq!(read.ids, ids(&["task1"]));
    }
}
