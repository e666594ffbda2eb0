//! Task queue lifecycle
//!
//! Composes the store, the index cache and the lease coordinator into queue
//! semantics:
//!
//! ```text
//! enqueue ──► task:{id}
//!                │  claim: index.read ─► compute_available ─► acquire ─► lease:{id}
//!                ▼
//! store_result ──► result:{id}, then delete task:{id}, lease:{id}, task-index
//! ```
//!
//! Every mutation is an independent single-key write. The coupling between a
//! task and its lease is kept by the order of these calls, not by the store.

use std::sync::Arc;

use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use tracing::{debug, info, instrument, warn};

use crate::clock::{system_clock, SharedClock};
use crate::config::QueueConfig;
use crate::index::TaskIndexCache;
use crate::keys::KeySpace;
use crate::lease::{AcquireOutcome, LeaseCoordinator};
use crate::metrics;
use crate::model::{
    Acceptance, LeaseRecord, ResultRecord, TaskId, TaskRecord, TaskResult, ValidationError,
};
use crate::shaper::{RequestShaper, TaskPayload};
use crate::store::{get_json, put_json, KvStore, StoreError};

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Store call failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Producer payload rejected before any write
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A task with this id is already queued
    #[error("task already queued: {0}")]
    Duplicate(TaskId),
}

/// A task together with the lease that grants this worker processing rights
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub task: TaskRecord,
    pub lease: LeaseRecord,
}

/// Outcome of [`TaskQueue::cancel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Task record removed (or was already absent)
    Cancelled,
    /// A worker holds the lease; the task was left alone
    InProgress { worker_id: String },
}

/// Queue built on a [`KvStore`]
pub struct TaskQueue {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    clock: SharedClock,
    config: QueueConfig,
    shaper: RequestShaper,
    index: TaskIndexCache,
    leases: LeaseCoordinator,
    enqueued: Counter<u64>,
    claimed: Counter<u64>,
}

impl TaskQueue {
    /// Create a queue using the system clock
    pub fn new(store: Arc<dyn KvStore>, config: QueueConfig) -> Self {
        Self::with_clock(store, config, system_clock())
    }

    /// Create a queue whose TTL and freshness decisions read `clock`
    pub fn with_clock(store: Arc<dyn KvStore>, config: QueueConfig, clock: SharedClock) -> Self {
        let keys = KeySpace::new(config.key_prefix.clone());
        let index = TaskIndexCache::new(store.clone(), keys.clone(), &config, clock.clone());
        let leases = LeaseCoordinator::new(store.clone(), keys.clone(), &config, clock.clone());
        let shaper = RequestShaper::new(clock.clone());

        Self {
            store,
            keys,
            clock,
            config,
            shaper,
            index,
            leases,
            enqueued: metrics::tasks_enqueued(),
            claimed: metrics::tasks_claimed(),
        }
    }

    /// Replace the request shaper (custom limits or classifier)
    pub fn with_shaper(mut self, shaper: RequestShaper) -> Self {
        self.shaper = shaper;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn index(&self) -> &TaskIndexCache {
        &self.index
    }

    pub fn leases(&self) -> &LeaseCoordinator {
        &self.leases
    }

    pub fn shaper(&self) -> &RequestShaper {
        &self.shaper
    }

    // =========================================================================
    // Producer side
    // =========================================================================

    /// Shape a raw payload and enqueue it
    pub async fn submit(&self, payload: TaskPayload) -> Result<Acceptance, QueueError> {
        let task = self.shaper.shape(payload)?;
        self.enqueue(task).await
    }

    /// Persist a task record
    ///
    /// Returns an acceptance only after the write succeeded. An id that is
    /// already queued is rejected; the check is a plain read, so two producers
    /// racing on one id can still both succeed.
    #[instrument(skip(self, task), fields(task_id = %task.id, priority = %task.priority))]
    pub async fn enqueue(&self, task: TaskRecord) -> Result<Acceptance, QueueError> {
        let key = self.keys.task_key(&task.id);
        if self.store.get(&key).await?.is_some() {
            return Err(QueueError::Duplicate(task.id));
        }

        put_json(self.store.as_ref(), &key, &task, Some(self.config.task_ttl)).await?;
        self.index.on_enqueue(&task.id);
        self.enqueued
            .add(1, &[KeyValue::new("priority", task.priority.as_str())]);

        info!(task_type = %task.task_type, source = %task.source, "Task enqueued");
        Ok(Acceptance::for_task(&task))
    }

    /// Pending task ids, served from the index cache
    pub async fn get_pending_requests(&self) -> Vec<TaskId> {
        self.index.read().await
    }

    /// Point read of a task record. Absent and expired tasks return `None`.
    pub async fn get_request(&self, id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
        Ok(get_json(self.store.as_ref(), &self.keys.task_key(id)).await?)
    }

    /// Remove a task that no worker holds yet
    ///
    /// Cancelling an absent task succeeds. The index is invalidated so the id
    /// disappears from the next read.
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn cancel(&self, id: &TaskId) -> Result<CancelOutcome, QueueError> {
        if let Some(lease) = self.leases.lease(id).await? {
            return Ok(CancelOutcome::InProgress {
                worker_id: lease.worker_id,
            });
        }

        self.store.delete(&self.keys.task_key(id)).await?;
        if let Err(e) = self.index.invalidate().await {
            warn!(error = %e, "Failed to invalidate index after cancel");
        }
        info!("Task cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    // =========================================================================
    // Results
    // =========================================================================

    /// Record the outcome of a task and retire it
    ///
    /// The result write must succeed. Deleting the task, its lease and the
    /// index snapshot afterwards is best-effort: failures are logged and the
    /// result stays authoritative. Calling this again for the same id
    /// overwrites the result and otherwise changes nothing.
    #[instrument(skip(self, result), fields(task_id = %id, status = %result.status))]
    pub async fn store_result(
        &self,
        id: &TaskId,
        result: TaskResult,
    ) -> Result<ResultRecord, QueueError> {
        let record = ResultRecord::from_result(id.clone(), result, self.clock.now());
        put_json(
            self.store.as_ref(),
            &self.keys.result_key(id),
            &record,
            Some(self.config.result_ttl),
        )
        .await?;

        if let Err(e) = self.store.delete(&self.keys.task_key(id)).await {
            warn!(error = %e, "Failed to delete task record after storing result");
        }
        if let Err(e) = self.leases.remove(id).await {
            warn!(error = %e, "Failed to delete lease after storing result");
        }
        if let Err(e) = self.index.invalidate().await {
            warn!(error = %e, "Failed to invalidate index after storing result");
        }

        info!("Result stored");
        Ok(record)
    }

    /// Point read of a result. Absent and expired results return `None`.
    pub async fn get_result(&self, id: &TaskId) -> Result<Option<ResultRecord>, QueueError> {
        Ok(get_json(self.store.as_ref(), &self.keys.result_key(id)).await?)
    }

    // =========================================================================
    // Worker side
    // =========================================================================

    /// Claim one task for `worker_id`
    ///
    /// Walks the available ids in index order, skipping ids whose task record
    /// is gone and ids another worker wins, up to `max_claim_candidates`.
    /// `None` means nothing is safely claimable right now, which includes a
    /// degraded store.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedTask>, QueueError> {
        let pending = self.index.read().await;
        if pending.is_empty() {
            return Ok(None);
        }

        let available = self.leases.compute_available(&pending).await;
        let mut index_stale = false;

        for id in available.iter().take(self.config.max_claim_candidates) {
            let Some(task) = self.get_request(id).await? else {
                debug!(task_id = %id, "Indexed task no longer exists");
                index_stale = true;
                continue;
            };

            match self.leases.acquire(id, worker_id).await? {
                AcquireOutcome::Acquired(lease) => {
                    if index_stale {
                        self.invalidate_stale_index().await;
                    }
                    self.claimed.add(1, &[]);
                    info!(task_id = %id, "Task claimed");
                    return Ok(Some(ClaimedTask { task, lease }));
                }
                AcquireOutcome::Conflict { holder } => {
                    debug!(task_id = %id, holder = %holder, "Lost claim, trying next task");
                }
            }
        }

        if index_stale {
            self.invalidate_stale_index().await;
        }
        Ok(None)
    }

    async fn invalidate_stale_index(&self) {
        if let Err(e) = self.index.invalidate().await {
            warn!(error = %e, "Failed to invalidate stale index");
        }
    }

    /// Give up a claimed task early so another worker can retry it
    pub async fn release(&self, id: &TaskId, worker_id: &str) -> Result<bool, QueueError> {
        Ok(self.leases.release(id, worker_id).await?)
    }

    /// Heartbeat: extend this worker's lease
    pub async fn renew_lease(
        &self,
        id: &TaskId,
        worker_id: &str,
    ) -> Result<AcquireOutcome, QueueError> {
        Ok(self.leases.renew(id, worker_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Priority, ResultStatus};
    use crate::store::InMemoryKvStore;
    use std::time::Duration;

    fn setup() -> (Arc<InMemoryKvStore>, ManualClock, TaskQueue) {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryKvStore::with_clock(Arc::new(clock.clone())));
        let queue = TaskQueue::with_clock(store.clone(), QueueConfig::default(), Arc::new(clock.clone()));
        (store, clock, queue)
    }

    fn payload(id: &str) -> TaskPayload {
        TaskPayload::new("chat_message", "slack", format!("content of {id}")).with_id(id)
    }

    #[tokio::test]
    async fn test_submit_and_get_request() {
        let (store, _clock, queue) = setup();

        let acceptance = queue
            .submit(payload("task1").with_priority("high"))
            .await
            .unwrap();
        assert_eq!(acceptance.id.as_str(), "task1");

        let task = queue.get_request(&acceptance.id).await.unwrap().unwrap();
        assert_eq!(task.priority, Priority::High);
        assert_eq!(store.ttl_of("task:task1"), Some(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_rejected() {
        let (_store, _clock, queue) = setup();
        queue.submit(payload("task1")).await.unwrap();

        let err = queue.submit(payload("task1")).await.unwrap_err();
        assert!(matches!(err, QueueError::Duplicate(id) if id.as_str() == "task1"));
    }

    #[tokio::test]
    async fn test_enqueue_write_failure_surfaces() {
        let (store, _clock, queue) = setup();
        store.fail_writes(true);

        let err = queue.submit(payload("task1")).await.unwrap_err();
        assert!(matches!(err, QueueError::Store(_)));
    }

    #[tokio::test]
    async fn test_validation_happens_before_write() {
        let (store, _clock, queue) = setup();

        let err = queue
            .submit(payload("task1").with_priority("urgent"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert_eq!(store.put_calls(), 0);
    }

    #[tokio::test]
    async fn test_task_expires_unclaimed() {
        let (_store, clock, queue) = setup();
        let acceptance = queue.submit(payload("task1")).await.unwrap();

        clock.advance(Duration::from_secs(3600));
        assert!(queue.get_request(&acceptance.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_complete_cycle() {
        let (store, _clock, queue) = setup();
        queue.submit(payload("task1")).await.unwrap();

        let claimed = queue.claim("worker-a").await.unwrap().unwrap();
        assert_eq!(claimed.task.id.as_str(), "task1");
        assert_eq!(claimed.lease.worker_id, "worker-a");

        // Leased task is not claimable by anyone else
        assert!(queue.claim("worker-b").await.unwrap().is_none());

        let record = queue
            .store_result(&claimed.task.id, TaskResult::completed("done"))
            .await
            .unwrap();
        assert_eq!(record.status, ResultStatus::Completed);
        assert!(!store.contains("task:task1"));
        assert!(!store.contains("lease:task1"));
        assert!(!store.contains("task-index"));
        assert!(queue.get_pending_requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_claim_skips_vanished_tasks() {
        let (store, _clock, queue) = setup();
        queue.submit(payload("task1")).await.unwrap();
        queue.submit(payload("task2")).await.unwrap();
        queue.get_pending_requests().await;

        // Removed behind the index's back
        store.delete("task:task1").await.unwrap();

        let claimed = queue.claim("worker-a").await.unwrap().unwrap();
        assert_eq!(claimed.task.id.as_str(), "task2");
    }

    #[tokio::test]
    async fn test_claim_fails_closed_on_lease_enumeration_failure() {
        let (store, _clock, queue) = setup();
        queue.submit(payload("task1")).await.unwrap();
        queue.get_pending_requests().await;

        store.reset_counters();
        store.fail_list(true);

        assert!(queue.claim("worker-a").await.unwrap().is_none());
        assert_eq!(store.list_calls_for("lease:"), 1);
        assert!(!store.contains("lease:task1"));
    }

    #[tokio::test]
    async fn test_release_makes_task_claimable() {
        let (_store, _clock, queue) = setup();
        queue.submit(payload("task1")).await.unwrap();

        let claimed = queue.claim("worker-a").await.unwrap().unwrap();
        assert!(queue.release(&claimed.task.id, "worker-a").await.unwrap());

        let reclaimed = queue.claim("worker-b").await.unwrap().unwrap();
        assert_eq!(reclaimed.task.id, claimed.task.id);
    }

    #[tokio::test]
    async fn test_cancel() {
        let (_store, _clock, queue) = setup();
        queue.submit(payload("task1")).await.unwrap();
        queue.submit(payload("task2")).await.unwrap();

        let claimed = queue.claim("worker-a").await.unwrap().unwrap();
        assert_eq!(
            queue.cancel(&claimed.task.id).await.unwrap(),
            CancelOutcome::InProgress {
                worker_id: "worker-a".to_string()
            }
        );

        let other = TaskId::parse("task2").unwrap();
        assert_eq!(queue.cancel(&other).await.unwrap(), CancelOutcome::Cancelled);
        assert!(queue.get_request(&other).await.unwrap().is_none());
        // Idempotent
        assert_eq!(queue.cancel(&other).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(queue.get_pending_requests().await, vec![claimed.task.id]);
    }
}
