//! Delivery strategies
//!
//! A producer hands a shaped [`TaskRecord`] to exactly one strategy, chosen
//! once from [`DeliveryMode`]:
//!
//! - [`KvQueueDelivery`] - persist for polling workers
//! - [`WebhookDelivery`] - POST to an HTTP endpoint
//! - [`DirectDelivery`] - run an in-process handler and store its result
//!
//! Push strategies never report a failure as a plain acceptance. Depending on
//! [`FallbackPolicy`] a failure is either returned as [`DeliveryError::Failed`]
//! or the task is enqueued and the outcome is [`DeliveryOutcome::Degraded`],
//! which carries the typed reason and is logged and counted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use tracing::{info, instrument, warn};

use crate::config::{ConfigError, DeliveryMode, FallbackPolicy};
use crate::handler::TaskHandler;
use crate::metrics;
use crate::model::{Acceptance, TaskRecord, TaskResult};
use crate::queue::{ClaimedTask, QueueError, TaskQueue};

/// Why a delivery did not go through as requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Store write failed
    StoreUnavailable,
    /// Receiver did not answer in time
    Timeout,
    /// Webhook transport failed or answered with a non-success status
    HttpError { status: Option<u16> },
    /// In-process handler returned a retryable error
    HandlerFailed,
}

impl DeliveryFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoreUnavailable => "store_unavailable",
            Self::Timeout => "timeout",
            Self::HttpError { .. } => "http_error",
            Self::HandlerFailed => "handler_failed",
        }
    }
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpError { status: Some(status) } => write!(f, "http_error ({status})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Successful hand-off
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Delivered through the configured strategy
    Accepted(Acceptance),
    /// Configured strategy failed; the task was enqueued instead
    Degraded {
        acceptance: Acceptance,
        reason: DeliveryFailure,
    },
}

impl DeliveryOutcome {
    pub fn acceptance(&self) -> &Acceptance {
        match self {
            Self::Accepted(acceptance) | Self::Degraded { acceptance, .. } => acceptance,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// Delivery errors
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Queue rejected the task (validation, duplicate id, or a failed fallback)
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Strategy failed and no fallback was taken
    #[error("{mode} delivery failed ({reason}): {message}")]
    Failed {
        mode: &'static str,
        reason: DeliveryFailure,
        message: String,
    },
}

impl DeliveryError {
    /// Typed reason, when the failure came from the strategy itself
    pub fn reason(&self) -> Option<DeliveryFailure> {
        match self {
            Self::Failed { reason, .. } => Some(*reason),
            Self::Queue(QueueError::Store(_)) => Some(DeliveryFailure::StoreUnavailable),
            Self::Queue(_) => None,
        }
    }
}

/// Common contract of all delivery strategies
#[async_trait]
pub trait TaskDelivery: Send + Sync {
    /// Strategy name for logs and metrics
    fn mode(&self) -> &'static str;

    /// Hand a task off
    async fn deliver(&self, task: TaskRecord) -> Result<DeliveryOutcome, DeliveryError>;

    /// Claim a task for a polling worker. Push strategies have nothing to claim.
    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedTask>, DeliveryError>;
}

/// Build the strategy selected by the queue's configuration
///
/// Direct mode needs a handler; the other modes ignore it.
pub fn build_delivery(
    queue: Arc<TaskQueue>,
    handler: Option<Arc<dyn TaskHandler>>,
) -> Result<Arc<dyn TaskDelivery>, ConfigError> {
    let policy = queue.config().fallback;
    match queue.config().delivery.clone() {
        DeliveryMode::KvQueue => Ok(Arc::new(KvQueueDelivery::new(queue))),
        DeliveryMode::Webhook { url, timeout } => {
            let url = url::Url::parse(&url).map_err(|_| ConfigError::InvalidValue {
                name: "TASKRELAY_WEBHOOK_URL",
                value: url.clone(),
            })?;
            Ok(Arc::new(WebhookDelivery::new(url, timeout, queue, policy)))
        }
        DeliveryMode::Direct => {
            let handler = handler.ok_or_else(|| {
                ConfigError::Invalid("direct delivery requires a task handler".to_string())
            })?;
            Ok(Arc::new(DirectDelivery::new(handler, queue, policy)))
        }
    }
}

/// Applies the fallback policy for push strategies
struct Fallback {
    policy: FallbackPolicy,
    queue: Arc<TaskQueue>,
    degraded: Counter<u64>,
}

impl Fallback {
    fn new(policy: FallbackPolicy, queue: Arc<TaskQueue>) -> Self {
        Self {
            policy,
            queue,
            degraded: metrics::delivery_degraded(),
        }
    }

    async fn handle(
        &self,
        mode: &'static str,
        task: TaskRecord,
        reason: DeliveryFailure,
        message: String,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        match self.policy {
            FallbackPolicy::Reject => {
                warn!(task_id = %task.id, mode, %reason, %message, "Delivery failed, rejecting");
                Err(DeliveryError::Failed {
                    mode,
                    reason,
                    message,
                })
            }
            FallbackPolicy::QueueFallback => {
                let task_id = task.id.clone();
                let acceptance = self.queue.enqueue(task).await?;
                self.degraded.add(
                    1,
                    &[
                        KeyValue::new("mode", mode),
                        KeyValue::new("reason", reason.as_str()),
                    ],
                );
                warn!(
                    task_id = %task_id,
                    mode,
                    %reason,
                    %message,
                    "Delivery failed, task enqueued as fallback"
                );
                Ok(DeliveryOutcome::Degraded { acceptance, reason })
            }
        }
    }
}

// =============================================================================
// KV queue
// =============================================================================

/// Persists tasks for polling workers
pub struct KvQueueDelivery {
    queue: Arc<TaskQueue>,
}

impl KvQueueDelivery {
    pub fn new(queue: Arc<TaskQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl TaskDelivery for KvQueueDelivery {
    fn mode(&self) -> &'static str {
        "kv_queue"
    }

    async fn deliver(&self, task: TaskRecord) -> Result<DeliveryOutcome, DeliveryError> {
        match self.queue.enqueue(task).await {
            Ok(acceptance) => Ok(DeliveryOutcome::Accepted(acceptance)),
            Err(QueueError::Store(e)) => Err(DeliveryError::Failed {
                mode: self.mode(),
                reason: DeliveryFailure::StoreUnavailable,
                message: e.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedTask>, DeliveryError> {
        Ok(self.queue.claim(worker_id).await?)
    }
}

// =============================================================================
// Webhook
// =============================================================================

/// POSTs each task as JSON to an HTTP endpoint
pub struct WebhookDelivery {
    url: url::Url,
    timeout: Duration,
    http: reqwest::Client,
    fallback: Fallback,
}

impl WebhookDelivery {
    pub fn new(
        url: url::Url,
        timeout: Duration,
        queue: Arc<TaskQueue>,
        policy: FallbackPolicy,
    ) -> Self {
        Self {
            url,
            timeout,
            http: reqwest::Client::new(),
            fallback: Fallback::new(policy, queue),
        }
    }
}

#[async_trait]
impl TaskDelivery for WebhookDelivery {
    fn mode(&self) -> &'static str {
        "webhook"
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, url = %self.url))]
    async fn deliver(&self, task: TaskRecord) -> Result<DeliveryOutcome, DeliveryError> {
        let response = self
            .http
            .post(self.url.clone())
            .timeout(self.timeout)
            .json(&task)
            .send()
            .await;

        let (reason, message) = match response {
            Ok(response) if response.status().is_success() => {
                info!("Task delivered to webhook");
                return Ok(DeliveryOutcome::Accepted(Acceptance::for_task(&task)));
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                (
                    DeliveryFailure::HttpError {
                        status: Some(status),
                    },
                    format!("HTTP {status}: {body}"),
                )
            }
            Err(e) if e.is_timeout() => (DeliveryFailure::Timeout, e.to_string()),
            Err(e) => (DeliveryFailure::HttpError { status: None }, e.to_string()),
        };

        self.fallback.handle(self.mode(), task, reason, message).await
    }

    async fn claim(&self, _worker_id: &str) -> Result<Option<ClaimedTask>, DeliveryError> {
        Ok(None)
    }
}

// =============================================================================
// Direct
// =============================================================================

/// Runs the handler inline and stores its result in the queue's result namespace
pub struct DirectDelivery {
    handler: Arc<dyn TaskHandler>,
    queue: Arc<TaskQueue>,
    timeout: Duration,
    fallback: Fallback,
}

impl DirectDelivery {
    /// The handler timeout starts at the queue's `direct_timeout`
    pub fn new(handler: Arc<dyn TaskHandler>, queue: Arc<TaskQueue>, policy: FallbackPolicy) -> Self {
        Self {
            handler,
            fallback: Fallback::new(policy, queue.clone()),
            timeout: queue.config().direct_timeout,
            queue,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn store(
        &self,
        task: TaskRecord,
        result: TaskResult,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        match self.queue.store_result(&task.id, result).await {
            Ok(record) => {
                let mut acceptance = Acceptance::for_task(&task);
                acceptance.estimated_completion = record.stored_at;
                Ok(DeliveryOutcome::Accepted(acceptance))
            }
            Err(e) => {
                self.fallback
                    .handle(
                        self.mode(),
                        task,
                        DeliveryFailure::StoreUnavailable,
                        e.to_string(),
                    )
                    .await
            }
        }
    }
}

#[async_trait]
impl TaskDelivery for DirectDelivery {
    fn mode(&self) -> &'static str {
        "direct"
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn deliver(&self, task: TaskRecord) -> Result<DeliveryOutcome, DeliveryError> {
        match tokio::time::timeout(self.timeout, self.handler.handle(&task)).await {
            Ok(Ok(result)) => self.store(task, result).await,
            Ok(Err(e)) if e.permanent => self.store(task, TaskResult::failed(e.message)).await,
            Ok(Err(e)) => {
                self.fallback
                    .handle(self.mode(), task, DeliveryFailure::HandlerFailed, e.message)
                    .await
            }
            Err(_) => {
                let message = format!("handler did not finish within {:?}", self.timeout);
                self.fallback
                    .handle(self.mode(), task, DeliveryFailure::Timeout, message)
                    .await
            }
        }
    }

    async fn claim(&self, _worker_id: &str) -> Result<Option<ClaimedTask>, DeliveryError> {
        Ok(None)
    }
}
