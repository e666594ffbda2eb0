// KV store connection for CLI commands

use std::sync::Arc;

use anyhow::{Context, Result};
use taskrelay_queue::{HttpKvConfig, HttpKvStore, QueueConfig, TaskId, TaskQueue};

/// Build a queue over the remote KV namespace
///
/// Queue settings (key prefix, TTLs, delivery mode) come from the same
/// `TASKRELAY_*` variables the worker reads.
pub fn connect(kv_url: &str, kv_token: Option<&str>) -> Result<Arc<TaskQueue>> {
    let mut kv_config = HttpKvConfig::new(kv_url);
    if let Some(token) = kv_token {
        kv_config = kv_config.with_token(token);
    }
    if let Some(timeout) = taskrelay_queue::env_secs("TASKRELAY_KV_TIMEOUT_SECS")? {
        kv_config = kv_config.with_request_timeout(timeout);
    }
    if let Some(timeout) = taskrelay_queue::env_secs("TASKRELAY_KV_LIST_TIMEOUT_SECS")? {
        kv_config = kv_config.with_list_timeout(timeout);
    }

    let store = HttpKvStore::new(kv_config).context("Invalid KV store URL")?;
    let config = QueueConfig::from_env().context("Invalid queue configuration")?;
    Ok(Arc::new(TaskQueue::new(Arc::new(store), config)))
}

/// Parse a task id argument
pub fn task_id(raw: &str) -> Result<TaskId> {
    TaskId::parse(raw).with_context(|| format!("Invalid task id: {raw}"))
}
