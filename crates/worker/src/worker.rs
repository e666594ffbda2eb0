//! Polling worker
//!
//! Claims tasks from the KV queue, runs them through a [`TaskHandler`] while a
//! heartbeat keeps the lease alive, and records the outcome.
//!
//! | Handler outcome      | Action                                   |
//! |----------------------|------------------------------------------|
//! | `Ok(result)`         | `store_result(result)`                   |
//! | permanent error      | `store_result(failed)`                   |
//! | retryable error      | release the lease for another worker     |
//! | timeout              | release the lease for another worker     |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskrelay_queue::{
    AcquireOutcome, ClaimedTask, QueueError, TaskHandler, TaskId, TaskQueue, TaskResult,
};
use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::config::WorkerConfig;
use crate::poller::{PollerError, TaskPoller};

/// What happened to one claimed task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Handler succeeded and the result was stored
    Completed,
    /// Handler failed permanently and a failed result was stored
    Failed,
    /// Handler failed or timed out; the lease was released for a retry
    Released,
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("in-flight tasks did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("worker is shutting down")]
    Shutdown,
}

/// Worker that polls the KV queue and executes tasks
pub struct Worker {
    queue: Arc<TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(queue: Arc<TaskQueue>, handler: Arc<dyn TaskHandler>, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            queue,
            handler,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Signal the run loop to stop claiming
    pub fn shutdown(&self) {
        info!(worker_id = %self.config.worker_id, "Shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Handle for signalling shutdown from another task
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Run until shutdown, then wait for in-flight tasks
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!(
            worker_id = %self.config.worker_id,
            max_concurrent = self.config.max_concurrent_tasks,
            "Starting worker"
        );

        let mut poller = TaskPoller::new(
            self.queue.clone(),
            self.config.worker_id.clone(),
            self.config.poller.clone(),
            self.shutdown_rx.clone(),
        );
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if poller.is_shutdown() {
                break;
            }

            // Only claim when there is capacity to run the task
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| WorkerError::Shutdown)?
                }
                _ = shutdown_rx.changed() => break,
            };

            match poller.poll().await {
                Ok(Some(claimed)) => {
                    let queue = self.queue.clone();
                    let handler = self.handler.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let task_id = claimed.task.id.clone();
                        if let Err(e) = execute(&queue, handler.as_ref(), &config, claimed).await {
                            error!(task_id = %task_id, error = %e, "Task execution failed");
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    if poller.wait().await {
                        break;
                    }
                }
                Err(PollerError::Shutdown) => break,
                Err(e) => {
                    drop(permit);
                    warn!(error = %e, "Claim failed, backing off");
                    if poller.wait().await {
                        break;
                    }
                }
            }
        }

        self.drain().await
    }

    /// Claim and execute at most one task inline
    pub async fn run_once(&self) -> Result<Option<ExecutionOutcome>, WorkerError> {
        match self.queue.claim(&self.config.worker_id).await? {
            Some(claimed) => Ok(Some(
                execute(&self.queue, self.handler.as_ref(), &self.config, claimed).await?,
            )),
            None => Ok(None),
        }
    }

    /// Wait for every permit to come back
    async fn drain(&self) -> Result<(), WorkerError> {
        let in_flight = self.config.max_concurrent_tasks - self.semaphore.available_permits();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight tasks");
        }

        let all = self.config.max_concurrent_tasks as u32;
        match tokio::time::timeout(self.config.shutdown_timeout, self.semaphore.acquire_many(all))
            .await
        {
            Ok(Ok(_permits)) => {
                info!(worker_id = %self.config.worker_id, "Worker stopped");
                Ok(())
            }
            Ok(Err(_)) => Err(WorkerError::Shutdown),
            Err(_) => Err(WorkerError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }
}

/// Run one claimed task to a recorded outcome
#[instrument(skip_all, fields(task_id = %claimed.task.id, worker_id = %config.worker_id))]
async fn execute(
    queue: &Arc<TaskQueue>,
    handler: &dyn TaskHandler,
    config: &WorkerConfig,
    claimed: ClaimedTask,
) -> Result<ExecutionOutcome, WorkerError> {
    let task = claimed.task;
    let heartbeat = Heartbeat::spawn(
        queue.clone(),
        task.id.clone(),
        config.worker_id.clone(),
        config.heartbeat_for(queue.config().lease_ttl),
    );

    let result = tokio::time::timeout(config.task_timeout, handler.handle(&task)).await;
    let lease_lost = heartbeat.stop().await;
    if lease_lost {
        warn!("Lease was taken over while the task ran; another worker may repeat it");
    }

    let outcome = match result {
        Ok(Ok(result)) => {
            queue.store_result(&task.id, result).await?;
            info!("Task completed");
            ExecutionOutcome::Completed
        }
        Ok(Err(e)) if e.permanent => {
            queue
                .store_result(&task.id, TaskResult::failed(e.message.clone()))
                .await?;
            warn!(error = %e, "Task failed permanently");
            ExecutionOutcome::Failed
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Task failed, releasing for retry");
            release(queue, &task.id, &config.worker_id).await?;
            ExecutionOutcome::Released
        }
        Err(_) => {
            warn!(timeout = ?config.task_timeout, "Task timed out, releasing for retry");
            release(queue, &task.id, &config.worker_id).await?;
            ExecutionOutcome::Released
        }
    };
    Ok(outcome)
}

async fn release(queue: &TaskQueue, id: &TaskId, worker_id: &str) -> Result<(), WorkerError> {
    if !queue.release(id, worker_id).await? {
        debug!(task_id = %id, "Lease already gone at release");
    }
    Ok(())
}

/// Background lease renewal for one task
struct Heartbeat {
    cancel_tx: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl Heartbeat {
    fn spawn(queue: Arc<TaskQueue>, task_id: TaskId, worker_id: String, every: Duration) -> Self {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = lost.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // First tick fires immediately; the claim just wrote the lease
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match queue.renew_lease(&task_id, &worker_id).await {
                            Ok(AcquireOutcome::Acquired(lease)) => {
                                debug!(task_id = %task_id, expires_at = %lease.expires_at, "Lease renewed");
                            }
                            Ok(AcquireOutcome::Conflict { holder }) => {
                                warn!(task_id = %task_id, holder = %holder, "Lease held by another worker");
                                lost_flag.store(true, Ordering::SeqCst);
                                break;
                            }
                            Err(e) => {
                                warn!(task_id = %task_id, error = %e, "Failed to renew lease");
                            }
                        }
                    }
                    _ = &mut cancel_rx => {
                        debug!(task_id = %task_id, "Heartbeat loop cancelled");
                        break;
                    }
                }
            }
        });

        Self {
            cancel_tx,
            handle,
            lost,
        }
    }

    /// Stop renewing. Returns whether the lease was lost along the way.
    async fn stop(self) -> bool {
        let _ = self.cancel_tx.send(());
        let _ = self.handle.await;
        self.lost.load(Ordering::SeqCst)
    }
}
