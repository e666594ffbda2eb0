// Result commands

use crate::client::task_id;
use crate::output::{print_field, OutputFormat};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use taskrelay_queue::{ResultRecord, TaskQueue, TaskResult};

#[derive(Subcommand)]
pub enum ResultsCommand {
    /// Record a result and retire the task
    Put {
        /// Task ID
        id: String,

        /// Outcome
        #[arg(long, short, value_parser = ["completed", "failed"])]
        status: String,

        /// Result message
        #[arg(long, short)]
        message: String,

        /// Estimated completion time (RFC 3339)
        #[arg(long)]
        eta: Option<DateTime<Utc>>,
    },

    /// Show a stored result
    Get {
        /// Task ID
        id: String,
    },
}

pub async fn run(
    command: ResultsCommand,
    queue: &TaskQueue,
    output: OutputFormat,
    quiet: bool,
) -> Result<()> {
    match command {
        ResultsCommand::Put {
            id,
            status,
            message,
            eta,
        } => {
            let id = task_id(&id)?;
            let mut result = match status.as_str() {
                "failed" => TaskResult::failed(message),
                _ => TaskResult::completed(message),
            };
            if let Some(at) = eta {
                result = result.with_estimated_completion(at);
            }

            let record = queue.store_result(&id, result).await?;
            if output.is_text() {
                if quiet {
                    println!("{}", record.id);
                } else {
                    println!("Stored result for {}", record.id);
                    print_field("Status", &record.status.to_string());
                }
            } else {
                output.print_value(&record)?;
            }
            Ok(())
        }
        ResultsCommand::Get { id } => {
            let id = task_id(&id)?;
            let Some(record) = queue.get_result(&id).await? else {
                bail!("No result for {id}");
            };
            if output.is_text() {
                print_result(&record);
            } else {
                output.print_value(&record)?;
            }
            Ok(())
        }
    }
}

fn print_result(record: &ResultRecord) {
    print_field("Task", record.id.as_str());
    print_field("Status", &record.status.to_string());
    print_field("Message", &record.message);
    print_field("Stored", &record.stored_at.to_rfc3339());
    if let Some(eta) = record.estimated_completion {
        print_field("ETA", &eta.to_rfc3339());
    }
}
