// Lease commands, mainly for operating on stuck tasks by hand

use crate::client::task_id;
use crate::output::{print_field, OutputFormat};
use anyhow::{bail, Result};
use clap::Subcommand;
use taskrelay_queue::{AcquireOutcome, LeaseRecord, TaskQueue};

#[derive(Subcommand)]
pub enum LeasesCommand {
    /// Claim the next available task
    Claim {
        /// Worker ID to record in the lease
        #[arg(long, short)]
        worker: String,
    },

    /// Show the lease on a task
    Get {
        /// Task ID
        id: String,
    },

    /// Release a lease held by a worker
    Release {
        /// Task ID
        id: String,

        /// Worker ID that holds the lease
        #[arg(long, short)]
        worker: String,
    },

    /// Extend a lease held by a worker
    Renew {
        /// Task ID
        id: String,

        /// Worker ID that holds the lease
        #[arg(long, short)]
        worker: String,
    },
}

pub async fn run(
    command: LeasesCommand,
    queue: &TaskQueue,
    output: OutputFormat,
    quiet: bool,
) -> Result<()> {
    match command {
        LeasesCommand::Claim { worker } => {
            let Some(claimed) = queue.claim(&worker).await? else {
                if output.is_text() {
                    if !quiet {
                        println!("No task available.");
                    }
                } else {
                    output.print_value(&serde_json::Value::Null)?;
                }
                return Ok(());
            };

            if output.is_text() {
                if quiet {
                    println!("{}", claimed.task.id);
                } else {
                    println!("Claimed task: {}", claimed.task.id);
                    print_field("Type", &claimed.task.task_type);
                    print_lease(&claimed.lease);
                }
            } else {
                output.print_value(&serde_json::json!({
                    "task": claimed.task,
                    "lease": claimed.lease,
                }))?;
            }
            Ok(())
        }
        LeasesCommand::Get { id } => {
            let id = task_id(&id)?;
            let lease = queue.leases().lease(&id).await?;
            match (&lease, output.is_text()) {
                (Some(lease), true) => print_lease(lease),
                (None, true) => println!("No lease on {id}."),
                (_, false) => output.print_value(&lease)?,
            }
            Ok(())
        }
        LeasesCommand::Release { id, worker } => {
            let id = task_id(&id)?;
            let released = queue.release(&id, &worker).await?;
            if output.is_text() {
                if !quiet {
                    if released {
                        println!("Released lease on {id}");
                    } else {
                        println!("No lease on {id} held by {worker}");
                    }
                }
            } else {
                output.print_value(&serde_json::json!({"id": id, "released": released}))?;
            }
            Ok(())
        }
        LeasesCommand::Renew { id, worker } => {
            let id = task_id(&id)?;
            match queue.renew_lease(&id, &worker).await? {
                AcquireOutcome::Acquired(lease) => {
                    if output.is_text() {
                        if !quiet {
                            print_lease(&lease);
                        }
                    } else {
                        output.print_value(&lease)?;
                    }
                    Ok(())
                }
                AcquireOutcome::Conflict { holder } => {
                    bail!("Lease on {id} is held by {holder}")
                }
            }
        }
    }
}

fn print_lease(lease: &LeaseRecord) {
    print_field("Task", lease.task_id.as_str());
    print_field("Worker", &lease.worker_id);
    print_field("Acquired", &lease.acquired_at.to_rfc3339());
    print_field("Expires", &lease.expires_at.to_rfc3339());
}
