// Taskrelay CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Support text/json output formats for scripting.
// Design Decision: Talk to the KV store directly through the queue crate; there is no server.

mod client;
mod commands;
mod output;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "taskrelay")]
#[command(about = "Taskrelay CLI - Enqueue, inspect and settle tasks in the KV queue")]
#[command(version)]
pub struct Cli {
    /// KV namespace base URL
    #[arg(long, env = "TASKRELAY_KV_URL")]
    pub kv_url: String,

    /// KV bearer token
    #[arg(long, env = "TASKRELAY_KV_TOKEN", hide_env_values = true)]
    pub kv_token: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit and inspect tasks
    Tasks {
        #[command(subcommand)]
        command: commands::tasks::TasksCommand,
    },

    /// Claim, release and renew leases
    Leases {
        #[command(subcommand)]
        command: commands::leases::LeasesCommand,
    },

    /// Record and read task results
    Results {
        #[command(subcommand)]
        command: commands::results::ResultsCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so they never mix with command output
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let queue = client::connect(&cli.kv_url, cli.kv_token.as_deref())?;
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Tasks { command } => {
            commands::tasks::run(command, &queue, output_format, cli.quiet).await
        }
        Commands::Leases { command } => {
            commands::leases::run(command, &queue, output_format, cli.quiet).await
        }
        Commands::Results { command } => {
            commands::results::run(command, &queue, output_format, cli.quiet).await
        }
    }
}
