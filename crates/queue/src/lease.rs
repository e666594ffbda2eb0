//! Lease coordination
//!
//! A lease under `lease:{id}` is an advisory claim. The store has no
//! conditional write, so two workers that pick the same id from the same
//! availability snapshot can both write a lease; the last write wins. With
//! [`ClaimVerification::ReadBack`] the loser usually notices by reading the
//! lease back, but a window remains between the read-back and the winner's
//! write. Task handlers must therefore be safe to run twice.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use tracing::{debug, instrument, warn};

use crate::clock::SharedClock;
use crate::config::{ClaimVerification, QueueConfig};
use crate::keys::KeySpace;
use crate::metrics;
use crate::model::{LeaseRecord, TaskId};
use crate::store::{get_json, put_json, KvStore, StoreError};

/// Result of an acquire or renew attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// This worker holds the lease
    Acquired(LeaseRecord),
    /// Another worker holds the lease
    Conflict { holder: String },
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Computes claimable tasks and manages leases
pub struct LeaseCoordinator {
    store: Arc<dyn KvStore>,
    keys: KeySpace,
    clock: SharedClock,
    lease_ttl: Duration,
    verification: ClaimVerification,
    list_calls: Counter<u64>,
    enumeration_failures: Counter<u64>,
    conflicts: Counter<u64>,
}

impl LeaseCoordinator {
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
            lease_ttl: config.lease_ttl,
            verification: config.claim_verification,
            list_calls: metrics::list_calls(),
            enumeration_failures: metrics::lease_enumeration_failures(),
            conflicts: metrics::claim_conflicts(),
        }
    }

    /// Ids of all currently leased tasks, from one `list` call
    pub async fn leased_ids(&self) -> Result<HashSet<TaskId>, StoreError> {
        self.list_calls
            .add(1, &[KeyValue::new("namespace", "lease")]);
        let keys = self.store.list(&self.keys.lease_prefix()).await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.keys.lease_id_from_key(key))
            .collect())
    }

    /// `pending` minus the leased ids, in `pending` order
    ///
    /// Issues exactly one lease enumeration regardless of how many ids are
    /// pending. If that enumeration fails nothing is reported as available.
    #[instrument(skip(self, pending), fields(pending = pending.len()))]
    pub async fn compute_available(&self, pending: &[TaskId]) -> Vec<TaskId> {
        if pending.is_empty() {
            return Vec::new();
        }

        let leased = match self.leased_ids().await {
            Ok(leased) => leased,
            Err(e) => {
                self.enumeration_failures.add(1, &[]);
                warn!(error = %e, "Lease enumeration failed, no tasks considered claimable");
                return Vec::new();
            }
        };

        let available: Vec<TaskId> = pending
            .iter()
            .filter(|id| !leased.contains(*id))
            .cloned()
            .collect();
        debug!(
            leased = leased.len(),
            available = available.len(),
            "Computed available tasks"
        );
        available
    }

    /// Current lease for `id`, if any
    pub async fn lease(&self, id: &TaskId) -> Result<Option<LeaseRecord>, StoreError> {
        get_json(self.store.as_ref(), &self.keys.lease_key(id)).await
    }

    /// Write a lease for `id` on behalf of `worker_id`
    ///
    /// Backs off with [`AcquireOutcome::Conflict`] when another worker's lease
    /// is visible before the write, or (with read-back verification) after it.
    /// Store failures are returned as errors.
    #[instrument(skip(self), fields(task_id = %id, worker_id = %worker_id))]
    pub async fn acquire(&self, id: &TaskId, worker_id: &str) -> Result<AcquireOutcome, StoreError> {
        if let Some(existing) = self.lease(id).await? {
            if !existing.is_held_by(worker_id) {
                return Ok(self.conflict(id, existing.worker_id));
            }
        }

        let lease = self.new_lease(id, worker_id, None);
        put_json(
            self.store.as_ref(),
            &self.keys.lease_key(id),
            &lease,
            Some(self.lease_ttl),
        )
        .await?;

        if self.verification == ClaimVerification::ReadBack {
            match self.lease(id).await? {
                Some(current) if !current.is_held_by(worker_id) => {
                    return Ok(self.conflict(id, current.worker_id));
                }
                Some(_) => {}
                None => {
                    debug!("Lease not yet visible on read-back, keeping claim");
                }
            }
        }

        debug!("Acquired lease");
        Ok(AcquireOutcome::Acquired(lease))
    }

    /// Extend a lease this worker holds
    ///
    /// A lease that has already expired is re-created, since no other worker
    /// took it over in the meantime.
    #[instrument(skip(self), fields(task_id = %id, worker_id = %worker_id))]
    pub async fn renew(&self, id: &TaskId, worker_id: &str) -> Result<AcquireOutcome, StoreError> {
        let acquired_at = match self.lease(id).await? {
            Some(existing) if !existing.is_held_by(worker_id) => {
                return Ok(self.conflict(id, existing.worker_id));
            }
            Some(existing) => Some(existing.acquired_at),
            None => None,
        };

        let lease = self.new_lease(id, worker_id, acquired_at);
        put_json(
            self.store.as_ref(),
            &self.keys.lease_key(id),
            &lease,
            Some(self.lease_ttl),
        )
        .await?;
        Ok(AcquireOutcome::Acquired(lease))
    }

    /// Delete the lease if `worker_id` holds it. Returns whether a lease was released.
    #[instrument(skip(self), fields(task_id = %id, worker_id = %worker_id))]
    pub async fn release(&self, id: &TaskId, worker_id: &str) -> Result<bool, StoreError> {
        match self.lease(id).await? {
            Some(existing) if existing.is_held_by(worker_id) => {
                self.store.delete(&self.keys.lease_key(id)).await?;
                debug!("Released lease");
                Ok(true)
            }
            Some(existing) => {
                debug!(holder = %existing.worker_id, "Lease held by another worker, not releasing");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Delete the lease regardless of holder
    pub async fn remove(&self, id: &TaskId) -> Result<(), StoreError> {
        self.store.delete(&self.keys.lease_key(id)).await
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    fn new_lease(
        &self,
        id: &TaskId,
        worker_id: &str,
        acquired_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> LeaseRecord {
        let now = self.clock.now();
        let ttl = ChronoDuration::from_std(self.lease_ttl).unwrap_or(ChronoDuration::MAX);
        LeaseRecord {
            task_id: id.clone(),
            worker_id: worker_id.to_string(),
            acquired_at: acquired_at.unwrap_or(now),
            expires_at: now + ttl,
        }
    }

    fn conflict(&self, id: &TaskId, holder: String) -> AcquireOutcome {
        self.conflicts.add(1, &[]);
        debug!(task_id = %id, holder = %holder, "Lease held by another worker");
        AcquireOutcome::Conflict { holder }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryKvStore;

    fn setup(verification: ClaimVerification) -> (Arc<InMemoryKvStore>, ManualClock, LeaseCoordinator) {
        let clock = ManualClock::default();
        let store = Arc::new(InMemoryKvStore::with_clock(Arc::new(clock.clone())));
        let config = QueueConfig::default().with_claim_verification(verification);
        let coordinator =
            LeaseCoordinator::new(store.clone(), KeySpace::default(), &config, Arc::new(clock.clone()));
        (store, clock, coordinator)
    }

    fn ids(raw: &[&str]) -> Vec<TaskId> {
        raw.iter().map(|id| TaskId::from_stored(id)).collect()
    }

    #[tokio::test]
    async fn test_compute_available_is_set_difference() {
        let (store, _clock, coordinator) = setup(ClaimVerification::ReadBack);
        for id in ["task1", "task3"] {
            store
                .put(&format!("lease:{id}"), "{}".to_string(), None)
                .await
                .unwrap();
        }

        let pending = ids(&["task1", "task2", "task3", "task4", "task5"]);
        let available = coordinator.compute_available(&pending).await;

        assert_eq!(available, ids(&["task2", "task4", "task5"]));
        assert_eq!(store.list_calls_for("lease:"), 1);
    }

    #[tokio::test]
    async fn test_compute_available_preserves_pending_order() {
        let (store, _clock, coordinator) = setup(ClaimVerification::ReadBack);
        store.put("lease:b", "{}".to_string(), None).await.unwrap();

        let available = coordinator.compute_available(&ids(&["c", "b", "a"])).await;
        assert_eq!(available, ids(&["c", "a"]));
    }

    #[tokio::test]
    async fn test_compute_available_fails_closed() {
        let (store, _clock, coordinator) = setup(ClaimVerification::ReadBack);
        store.fail_list(true);

        let available = coordinator.compute_available(&ids(&["task1", "task2"])).await;
        assert!(available.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_and_conflict() {
        let (store, _clock, coordinator) = setup(ClaimVerification::ReadBack);
        let id = TaskId::from_stored("task1");

        let outcome = coordinator.acquire(&id, "worker-a").await.unwrap();
        let AcquireOutcome::Acquired(lease) = outcome else {
            panic!("expected acquired, got {outcome:?}");
        };
        assert_eq!(lease.worker_id, "worker-a");
        assert_eq!(store.ttl_of("lease:task1"), Some(Duration::from_secs(300)));

        let outcome = coordinator.acquire(&id, "worker-b").await.unwrap();
        assert_eq!(
            outcome,
            AcquireOutcome::Conflict {
                holder: "worker-a".to_string()
            }
        );

        // Same worker can re-acquire
        assert!(coordinator.acquire(&id, "worker-a").await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let (_store, clock, coordinator) = setup(ClaimVerification::ReadBack);
        let id = TaskId::from_stored("task1");

        coordinator.acquire(&id, "worker-a").await.unwrap();
        clock.advance(Duration::from_secs(301));

        assert!(coordinator.acquire(&id, "worker-b").await.unwrap().is_acquired());
        assert!(coordinator.compute_available(&[id.clone()]).await.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_write_failure_is_error() {
        let (store, _clock, coordinator) = setup(ClaimVerification::ReadBack);
        store.fail_writes(true);

        let result = coordinator.acquire(&TaskId::from_stored("task1"), "worker-a").await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_release_only_own_lease() {
        let (store, _clock, coordinator) = setup(ClaimVerification::ReadBack);
        let id = TaskId::from_stored("task1");
        coordinator.acquire(&id, "worker-a").await.unwrap();

        assert!(!coordinator.release(&id, "worker-b").await.unwrap());
        assert!(store.contains("lease:task1"));

        assert!(coordinator.release(&id, "worker-a").await.unwrap());
        assert!(!store.contains("lease:task1"));

        assert!(!coordinator.release(&id, "worker-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_extends_ttl() {
        let (store, clock, coordinator) = setup(ClaimVerification::ReadBack);
        let id = TaskId::from_stored("task1");
        let AcquireOutcome::Acquired(first) = coordinator.acquire(&id, "worker-a").await.unwrap()
        else {
            panic!("expected acquired");
        };

        clock.advance(Duration::from_secs(200));
        let AcquireOutcome::Acquired(renewed) = coordinator.renew(&id, "worker-a").await.unwrap()
        else {
            panic!("expected renewed");
        };

        assert_eq!(renewed.acquired_at, first.acquired_at);
        assert!(renewed.expires_at > first.expires_at);
        assert_eq!(store.ttl_of("lease:task1"), Some(Duration::from_secs(300)));

        assert!(!coordinator.renew(&id, "worker-b").await.unwrap().is_acquired());
    }
}
