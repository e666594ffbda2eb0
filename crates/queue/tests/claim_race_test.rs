//! Concurrent claim behaviour on a store without conditional writes
//!
//! Run with: cargo test -p taskrelay-queue --test claim_race_test

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use taskrelay_queue::{
    AcquireOutcome, ClaimVerification, InMemoryKvStore, KvStore, LeaseRecord, QueueConfig,
    StoreError, TaskId, TaskPayload, TaskQueue,
};

/// Lets a competing worker's lease write land right after ours
struct InterleavingStore {
    inner: Arc<InMemoryKvStore>,
    competitor: String,
    armed: AtomicBool,
}

impl InterleavingStore {
    fn new(inner: Arc<InMemoryKvStore>, competitor: &str) -> Self {
        Self {
            inner,
            competitor: competitor.to_string(),
            armed: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl KvStore for InterleavingStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.inner.put(key, value, ttl).await?;

        if key.starts_with("lease:") && self.armed.swap(false, Ordering::SeqCst) {
            let task_id = TaskId::parse(key.trim_start_matches("lease:")).unwrap();
            let theirs = LeaseRecord {
                task_id,
                worker_id: self.competitor.clone(),
                acquired_at: Utc::now(),
                expires_at: Utc::now() + chrono::Duration::minutes(5),
            };
            self.inner
                .put(key, serde_json::to_string(&theirs).unwrap(), ttl)
                .await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(prefix).await
    }
}

async fn queue_with(verification: ClaimVerification) -> (Arc<InMemoryKvStore>, TaskQueue) {
    let inner = Arc::new(InMemoryKvStore::new());
    let store = Arc::new(InterleavingStore::new(inner.clone(), "worker-b"));
    let queue = TaskQueue::new(
        store,
        QueueConfig::default().with_claim_verification(verification),
    );
    queue
        .submit(TaskPayload::new("t", "s", "c").with_id("task1"))
        .await
        .unwrap();
    (inner, queue)
}

#[tokio::test]
async fn read_back_detects_overwritten_lease() {
    let (_inner, queue) = queue_with(ClaimVerification::ReadBack).await;
    let id = TaskId::parse("task1").unwrap();

    let outcome = queue.leases().acquire(&id, "worker-a").await.unwrap();
    assert_eq!(
        outcome,
        AcquireOutcome::Conflict {
            holder: "worker-b".to_string()
        }
    );

    // The claim backs off instead of handing the task to worker-a
    assert!(queue.claim("worker-a").await.unwrap().is_none());
}

#[tokio::test]
async fn without_verification_race_goes_undetected() {
    let (_inner, queue) = queue_with(ClaimVerification::None).await;

    // worker-a believes it holds the task while worker-b's lease is the one stored
    let claimed = queue.claim("worker-a").await.unwrap().unwrap();
    assert_eq!(claimed.lease.worker_id, "worker-a");

    let stored = queue
        .leases()
        .lease(&claimed.task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.worker_id, "worker-b");
}

#[tokio::test]
async fn serialized_claims_never_share_a_task() {
    let store = Arc::new(InMemoryKvStore::new());
    let queue = Arc::new(TaskQueue::new(store, QueueConfig::default()));
    for i in 0..5 {
        queue
            .submit(TaskPayload::new("t", "s", "c").with_id(format!("task{i}")))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..5 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.claim(&format!("worker-{w}")).await.unwrap()
        }));
    }

    let mut claimed: Vec<TaskId> = Vec::new();
    for handle in handles {
        if let Some(task) = handle.await.unwrap() {
            claimed.push(task.task.id);
        }
    }

    // The in-memory store serializes each call, so every acquire sees the
    // previous lease and no id is handed out twice
    let mut unique = claimed.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), claimed.len());
}
