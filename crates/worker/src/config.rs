//! Worker configuration

use std::time::Duration;

use taskrelay_queue::{env_secs, ConfigError};
use uuid::Uuid;

use crate::poller::PollerConfig;

/// Configuration for a polling worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity written into every lease this worker takes
    pub worker_id: String,
    /// Maximum tasks executing at once
    pub max_concurrent_tasks: usize,
    /// Claim polling behaviour
    pub poller: PollerConfig,
    /// Lease renewal period. `None` renews at a third of the lease TTL.
    pub heartbeat_interval: Option<Duration>,
    /// Upper bound on one handler invocation
    pub task_timeout: Duration,
    /// How long shutdown waits for in-flight tasks
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrent_tasks: 4,
            poller: PollerConfig::default(),
            heartbeat_interval: None,
            task_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Heartbeat period for a given lease TTL
    pub fn heartbeat_for(&self, lease_ttl: Duration) -> Duration {
        self.heartbeat_interval
            .unwrap_or(lease_ttl / 3)
            .max(Duration::from_millis(100))
    }

    /// Create configuration from environment variables
    ///
    /// - `WORKER_ID` (default: `worker-<uuid v7>`)
    /// - `MAX_CONCURRENT_TASKS` (default: 4)
    /// - `POLL_MIN_INTERVAL_MS`, `POLL_MAX_INTERVAL_MS`
    /// - `HEARTBEAT_INTERVAL_SECS`, `TASK_TIMEOUT_SECS`, `SHUTDOWN_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(worker_id) = std::env::var("WORKER_ID") {
            config.worker_id = worker_id;
        }
        if let Some(max) = env_parse::<usize>("MAX_CONCURRENT_TASKS")? {
            config = config.with_max_concurrent_tasks(max);
        }
        if let Some(ms) = env_parse::<u64>("POLL_MIN_INTERVAL_MS")? {
            config.poller = config.poller.with_min_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("POLL_MAX_INTERVAL_MS")? {
            config.poller = config.poller.with_max_interval(Duration::from_millis(ms));
        }
        config.heartbeat_interval = env_secs("HEARTBEAT_INTERVAL_SECS")?;
        if let Some(timeout) = env_secs("TASK_TIMEOUT_SECS")? {
            config.task_timeout = timeout;
        }
        if let Some(timeout) = env_secs("SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = timeout;
        }

        if config.poller.min_interval > config.poller.max_interval {
            return Err(ConfigError::Invalid(
                "POLL_MIN_INTERVAL_MS must not exceed POLL_MAX_INTERVAL_MS".to_string(),
            ));
        }
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(None),
    }
}
