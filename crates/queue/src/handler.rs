//! Task handler contract
//!
//! The logic that gives a task its meaning lives outside this crate. Workers
//! and the direct delivery strategy both call it through [`TaskHandler`].

use async_trait::async_trait;

use crate::model::{TaskRecord, TaskResult};

/// Handler failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Retrying will not help; record a failed result instead of releasing
    pub permanent: bool,
}

impl HandlerError {
    /// Failure worth retrying on another worker
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    /// Failure that should end the task
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }
}

/// Executes one task
///
/// The same task may be handed to two workers when their claims race, so
/// implementations must tolerate running a task more than once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskRecord) -> Result<TaskResult, HandlerError>;
}
