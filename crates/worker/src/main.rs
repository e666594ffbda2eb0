use std::sync::Arc;

use anyhow::{Context, Result};
use taskrelay_queue::{HttpKvConfig, HttpKvStore, QueueConfig, TaskQueue};
use taskrelay_worker::{init_telemetry, LogHandler, TelemetryConfig, Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - OTEL_SERVICE_NAME: Service name (default: "taskrelay-worker")
    // - OTEL_EXPORTER_OTLP_ENDPOINT: OTLP endpoint (e.g., "http://localhost:4317")
    // - RUST_LOG or LOG_LEVEL: Log filter
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "taskrelay" {
        telemetry_config.service_name = "taskrelay-worker".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter =
            Some("taskrelay_worker=info,taskrelay_queue=info".to_string());
    }

    // Keep the guard alive for the lifetime of the application
    let _telemetry_guard = init_telemetry(telemetry_config);

    let kv_config = HttpKvConfig::from_env().context("Invalid KV store configuration")?;
    let queue_config = QueueConfig::from_env().context("Invalid queue configuration")?;
    let worker_config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    let store = HttpKvStore::new(kv_config).context("Failed to create KV store client")?;
    let queue = Arc::new(TaskQueue::new(Arc::new(store), queue_config));

    tracing::info!(
        worker_id = %worker_config.worker_id,
        max_concurrent = worker_config.max_concurrent_tasks,
        key_prefix = %queue.config().key_prefix,
        "taskrelay-worker starting"
    );

    let worker = Worker::new(queue, Arc::new(LogHandler), worker_config);
    let shutdown = worker.shutdown_handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            let _ = shutdown.send(true);
        }
    });

    if let Err(e) = worker.run().await {
        tracing::error!(error = %e, "Worker error");
        return Err(e.into());
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
