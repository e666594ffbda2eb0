//! Built-in task handlers

use async_trait::async_trait;
use taskrelay_queue::{HandlerError, TaskHandler, TaskRecord, TaskResult};
use tracing::info;

/// Logs each task and completes it
///
/// Default handler for the `taskrelay-worker` binary, useful for wiring checks
/// before a real handler is plugged in.
#[derive(Debug, Clone, Default)]
pub struct LogHandler;

#[async_trait]
impl TaskHandler for LogHandler {
    async fn handle(&self, task: &TaskRecord) -> Result<TaskResult, HandlerError> {
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            source = %task.source,
            priority = %task.priority,
            content_len = task.content.len(),
            "Handling task"
        );
        Ok(TaskResult::completed(format!(
            "{} task from {} processed",
            task.task_type, task.source
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskrelay_queue::{Priority, ResultStatus, TaskId};

    #[tokio::test]
    async fn test_log_handler_completes() {
        let task = TaskRecord {
            id: TaskId::parse("task1").unwrap(),
            task_type: "chat_message".to_string(),
            source: "slack".to_string(),
            content: "hello".to_string(),
            priority: Priority::High,
            delegation_hints: vec![],
            skill_hints: vec![],
            metadata: Default::default(),
            queued_at: Utc::now(),
        };

        let result = LogHandler.handle(&task).await.unwrap();
        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(result.message, "chat_message task from slack processed");
    }
}
