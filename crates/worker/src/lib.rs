pub mod config;
pub mod handlers;
pub mod poller;
pub mod telemetry;
pub mod worker;

// Re-export main types
pub use config::WorkerConfig;
pub use handlers::LogHandler;
pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use worker::{ExecutionOutcome, Worker, WorkerError};

// Handler contract lives in the queue crate so direct delivery can share it
pub use taskrelay_queue::{HandlerError, TaskHandler};
