//! Records persisted in the store

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_TASK_ID_LEN: usize = 128;

/// Validation error for producer payloads
///
/// Raised before any store write happens. Malformed input is never coerced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Required field is empty
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    /// Task id has an invalid length or characters
    #[error("invalid task id {0:?}: expected 1-128 characters from [A-Za-z0-9._-]")]
    InvalidId(String),

    /// Priority is not one of low, medium, high, critical
    #[error("invalid priority {0:?}: expected low, medium, high or critical")]
    InvalidPriority(String),

    /// Metadata is not a JSON object
    #[error("metadata must be a JSON object")]
    MetadataNotObject,

    /// Serialized metadata exceeds the configured bound
    #[error("metadata is {size} bytes, limit is {limit}")]
    MetadataTooLarge { size: usize, limit: usize },

    /// A hint list exceeds the configured bound
    #[error("{field} has {count} entries, limit is {limit}")]
    TooManyHints {
        field: &'static str,
        count: usize,
        limit: usize,
    },
}

/// Unique task identifier
///
/// Ids built by [`TaskId::parse`] are checked for length and character set,
/// which keeps them safe to embed in store keys. Generated ids are UUID v7, so
/// lexicographic store order roughly follows creation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a new time-ordered id
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Validate a producer-supplied id
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if raw.is_empty() {
            return Err(ValidationError::EmptyField("id"));
        }
        let well_formed = raw.len() <= MAX_TASK_ID_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !well_formed {
            return Err(ValidationError::InvalidId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Wrap an id read back from a store key, which was validated on the way in
    pub(crate) fn from_stored(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Producer-supplied priority
///
/// Carried as metadata only. The queue does not reorder by priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Rough processing estimate used for the acceptance ETA
    pub fn estimated_processing(&self) -> Duration {
        match self {
            Self::Critical => Duration::from_secs(60),
            Self::High => Duration::from_secs(5 * 60),
            Self::Medium => Duration::from_secs(15 * 60),
            Self::Low => Duration::from_secs(60 * 60),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(ValidationError::InvalidPriority(other.to_string())),
        }
    }
}

/// A queued unit of work, stored under `task:{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,

    /// Producer-defined task type (e.g. "chat_message", "repo_change")
    #[serde(rename = "type")]
    pub task_type: String,

    /// Originating channel or component
    pub source: String,

    pub content: String,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub delegation_hints: Vec<String>,

    #[serde(default)]
    pub skill_hints: Vec<String>,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    pub queued_at: DateTime<Utc>,
}

/// Advisory claim of one worker over one task, stored under `lease:{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub task_id: TaskId,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.worker_id == worker_id
    }
}

/// Terminal status of a processed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown result status: {other}")),
        }
    }
}

/// Outcome reported by whoever processed a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub status: ResultStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Completed,
            message: message.into(),
            estimated_completion: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            message: message.into(),
            estimated_completion: None,
        }
    }

    pub fn with_estimated_completion(mut self, at: DateTime<Utc>) -> Self {
        self.estimated_completion = Some(at);
        self
    }
}

/// Stored outcome, under `result:{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub id: TaskId,
    pub status: ResultStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_completion: Option<DateTime<Utc>>,
    pub stored_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn from_result(id: TaskId, result: TaskResult, stored_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: result.status,
            message: result.message,
            estimated_completion: result.estimated_completion,
            stored_at,
        }
    }
}

/// Acceptance status returned to producers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceStatus {
    Accepted,
}

/// Returned to a producer once a task has been durably handed off
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acceptance {
    pub id: TaskId,
    pub status: AcceptanceStatus,
    pub estimated_completion: DateTime<Utc>,
}

impl Acceptance {
    /// Acceptance for `task` with an ETA derived from its priority
    pub fn for_task(task: &TaskRecord) -> Self {
        let estimate = ChronoDuration::from_std(task.priority.estimated_processing())
            .unwrap_or_else(|_| ChronoDuration::hours(1));
        Self {
            id: task.id.clone(),
            status: AcceptanceStatus::Accepted,
            estimated_completion: task.queued_at + estimate,
        }
    }
}
