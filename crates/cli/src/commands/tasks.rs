// Task submission and inspection commands

use std::sync::Arc;

use crate::client::task_id;
use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};
use anyhow::{bail, Context, Result};
use clap::Subcommand;
use serde::Serialize;
use taskrelay_queue::{
    build_delivery, CancelOutcome, DeliveryMode, DeliveryOutcome, TaskDelivery, TaskPayload,
    TaskQueue, TaskRecord,
};

#[derive(Subcommand)]
pub enum TasksCommand {
    /// Submit a task through the configured delivery mode
    Enqueue {
        /// Task type (e.g. "chat_message")
        #[arg(long = "type", short = 't')]
        task_type: String,

        /// Originating channel or component
        #[arg(long, short)]
        source: String,

        /// Task body
        #[arg(long, short)]
        content: String,

        /// Priority: low, medium, high or critical
        #[arg(long, short)]
        priority: Option<String>,

        /// Explicit task id (generated if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Delegation hints (repeatable)
        #[arg(long = "delegate")]
        delegation_hints: Vec<String>,

        /// Skill hints (repeatable)
        #[arg(long = "skill")]
        skill_hints: Vec<String>,

        /// Metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },

    /// List pending task ids from the index
    Pending,

    /// Show a task record
    Get {
        /// Task ID
        id: String,
    },

    /// Remove a task nobody is working on
    Cancel {
        /// Task ID
        id: String,
    },
}

#[derive(Debug, Serialize)]
struct EnqueueOutput<'a> {
    #[serde(flatten)]
    acceptance: &'a taskrelay_queue::Acceptance,
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    degraded: Option<String>,
}

pub async fn run(
    command: TasksCommand,
    queue: &Arc<TaskQueue>,
    output: OutputFormat,
    quiet: bool,
) -> Result<()> {
    match command {
        TasksCommand::Enqueue {
            task_type,
            source,
            content,
            priority,
            id,
            delegation_hints,
            skill_hints,
            metadata,
        } => {
            let mut payload = TaskPayload::new(task_type, source, content);
            payload.id = id;
            payload.priority = priority;
            payload.delegation_hints = delegation_hints;
            payload.skill_hints = skill_hints;
            if let Some(raw) = metadata {
                let value = serde_json::from_str(&raw).context("--metadata is not valid JSON")?;
                payload = payload.with_metadata(value);
            }
            enqueue(queue, output, quiet, payload).await
        }
        TasksCommand::Pending => pending(queue, output).await,
        TasksCommand::Get { id } => get(queue, output, &id).await,
        TasksCommand::Cancel { id } => cancel(queue, output, quiet, &id).await,
    }
}

async fn enqueue(
    queue: &Arc<TaskQueue>,
    output: OutputFormat,
    quiet: bool,
    payload: TaskPayload,
) -> Result<()> {
    let task = queue.shaper().shape(payload)?;
    let delivery = producer_delivery(queue)?;
    let outcome = delivery.deliver(task).await?;

    let degraded = match &outcome {
        DeliveryOutcome::Degraded { reason, .. } => Some(reason.to_string()),
        DeliveryOutcome::Accepted(_) => None,
    };
    let acceptance = outcome.acceptance();

    if output.is_text() {
        if quiet {
            println!("{}", acceptance.id);
        } else {
            println!("Accepted task: {}", acceptance.id);
            print_field("Delivery", delivery.mode());
            print_field("ETA", &acceptance.estimated_completion.to_rfc3339());
            if let Some(reason) = &degraded {
                eprintln!(
                    "warning: {} delivery failed ({}), task was queued instead",
                    delivery.mode(),
                    reason
                );
            }
        }
    } else {
        output.print_value(&EnqueueOutput {
            acceptance,
            mode: delivery.mode(),
            degraded,
        })?;
    }
    Ok(())
}

/// The CLI carries no task handler, so direct mode cannot run here
fn producer_delivery(queue: &Arc<TaskQueue>) -> Result<Arc<dyn TaskDelivery>> {
    if queue.config().delivery == DeliveryMode::Direct {
        bail!(
            "direct delivery runs tasks inside the process that owns the handler; \
             set TASKRELAY_DELIVERY_MODE=kv_queue or webhook to enqueue from the CLI"
        );
    }
    build_delivery(queue.clone(), None).context("Invalid delivery configuration")
}

async fn pending(queue: &TaskQueue, output: OutputFormat) -> Result<()> {
    let read = queue.index().read_detailed().await;

    if output.is_text() {
        if read.ids.is_empty() {
            println!("No pending tasks.");
        } else {
            print_table_header(&[("ID", 40)]);
            for id in &read.ids {
                print_table_row(&[(id.as_str(), 40)]);
            }
        }
        eprintln!(
            "index: {} ({}s old)",
            read.source.as_str(),
            read.age.as_secs()
        );
    } else {
        output.print_value(&serde_json::json!({
            "ids": read.ids,
            "source": read.source.as_str(),
            "ageSecs": read.age.as_secs(),
        }))?;
    }
    Ok(())
}

async fn get(queue: &TaskQueue, output: OutputFormat, raw_id: &str) -> Result<()> {
    let id = task_id(raw_id)?;
    let Some(task) = queue.get_request(&id).await? else {
        bail!("Task not found: {id}");
    };

    if output.is_text() {
        print_task(&task);
    } else {
        output.print_value(&task)?;
    }
    Ok(())
}

async fn cancel(queue: &TaskQueue, output: OutputFormat, quiet: bool, raw_id: &str) -> Result<()> {
    let id = task_id(raw_id)?;
    match queue.cancel(&id).await? {
        CancelOutcome::Cancelled => {
            if output.is_text() {
                if !quiet {
                    println!("Cancelled task: {id}");
                }
            } else {
                output.print_value(&serde_json::json!({"id": id, "cancelled": true}))?;
            }
            Ok(())
        }
        CancelOutcome::InProgress { worker_id } => {
            bail!("Task {id} is being worked on by {worker_id}")
        }
    }
}

fn print_task(task: &TaskRecord) {
    print_field("ID", task.id.as_str());
    print_field("Type", &task.task_type);
    print_field("Source", &task.source);
    print_field("Priority", task.priority.as_str());
    print_field("Queued", &task.queued_at.to_rfc3339());
    if !task.delegation_hints.is_empty() {
        print_field("Delegation", &task.delegation_hints.join(", "));
    }
    if !task.skill_hints.is_empty() {
        print_field("Skills", &task.skill_hints.join(", "));
    }
    if !task.metadata.is_empty() {
        print_field(
            "Metadata",
            &serde_json::Value::Object(task.metadata.clone()).to_string(),
        );
    }
    println!();
    println!("{}", task.content);
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskrelay_queue::{InMemoryKvStore, QueueConfig};

    fn queue(config: QueueConfig) -> Arc<TaskQueue> {
        Arc::new(TaskQueue::new(Arc::new(InMemoryKvStore::new()), config))
    }

    #[test]
    fn test_direct_mode_is_refused_with_hint() {
        let err = producer_delivery(&queue(
            QueueConfig::default().with_delivery(DeliveryMode::Direct),
        ))
        .err()
        .unwrap();
        assert!(err.to_string().contains("TASKRELAY_DELIVERY_MODE=kv_queue"));
    }

    #[test]
    fn test_kv_queue_mode_builds() {
        let delivery = producer_delivery(&queue(QueueConfig::default())).unwrap();
        assert_eq!(delivery.mode(), "kv_queue");
    }
}
