//! Task polling with exponential backoff
//!
//! Claims one task at a time from the KV queue, backing off while the queue
//! is empty or the store is degraded and snapping back once work appears.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskrelay_queue::{ClaimedTask, QueueError, TaskQueue};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when tasks are available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no tasks found
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Claims tasks for one worker
///
/// Every empty poll multiplies the wait by `backoff_multiplier` up to
/// `max_interval`; a successful claim resets it to `min_interval`. Each poll
/// costs at least one `lease:` listing, so idle workers must not spin.
pub struct TaskPoller {
    queue: Arc<TaskQueue>,
    worker_id: String,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(
        queue: Arc<TaskQueue>,
        worker_id: String,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            worker_id,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Try to claim one task and update backoff state
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self) -> Result<Option<ClaimedTask>, PollerError> {
        if *self.shutdown_rx.borrow() {
            debug!("Poller shutdown requested");
            return Err(PollerError::Shutdown);
        }

        match self.queue.claim(&self.worker_id).await {
            Ok(Some(claimed)) => {
                self.reset_backoff();
                debug!(task_id = %claimed.task.id, "Claimed task");
                Ok(Some(claimed))
            }
            Ok(None) => {
                self.increase_backoff();
                trace!(
                    interval_ms = self.current_interval.as_millis(),
                    "No tasks found, backing off"
                );
                Ok(None)
            }
            Err(e) => {
                self.increase_backoff();
                Err(PollerError::Queue(e))
            }
        }
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled while waiting.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("worker is shutting down")]
    Shutdown,
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
