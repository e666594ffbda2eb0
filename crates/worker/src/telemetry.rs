//! Logging and OpenTelemetry export for the worker binary
//!
//! Console output always goes through a `tracing-subscriber` fmt layer. When
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans are exported over OTLP and the
//! queue's `taskrelay` counters get a real meter provider; otherwise those
//! counters stay on the global no-op meter.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Where and how telemetry is emitted
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`
    pub otlp_endpoint: Option<String>,
    /// Reported as `deployment.environment`
    pub environment: Option<String>,
    pub enable_console: bool,
    /// `EnvFilter` directive, e.g. `taskrelay_queue=debug`
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "taskrelay".to_string(),
            service_version: None,
            otlp_endpoint: None,
            environment: None,
            enable_console: true,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Read `OTEL_SERVICE_NAME`, `OTEL_SERVICE_VERSION`,
    /// `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_ENVIRONMENT` and `RUST_LOG`
    /// (falling back to `LOG_LEVEL`)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: std::env::var("OTEL_SERVICE_VERSION").ok(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            environment: std::env::var("OTEL_ENVIRONMENT").ok(),
            log_filter: std::env::var("RUST_LOG")
                .or_else(|_| std::env::var("LOG_LEVEL"))
                .ok(),
            ..defaults
        }
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![KeyValue::new("service.name", self.service_name.clone())];
        if let Some(version) = &self.service_version {
            attributes.push(KeyValue::new("service.version", version.clone()));
        }
        if let Some(env) = &self.environment {
            attributes.push(KeyValue::new("deployment.environment", env.clone()));
        }
        Resource::builder().with_attributes(attributes).build()
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_deref()
            .and_then(|directive| EnvFilter::try_new(directive).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Flushes and shuts down the OTLP providers on drop
///
/// Hold it for the lifetime of the process.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shutdown tracer provider: {:?}", e);
            }
        }
        if let Some(provider) = self.meter_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shutdown meter provider: {:?}", e);
            }
        }
    }
}

/// Install the global subscriber and, if configured, the OTLP exporters
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let console_layer = config.enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(config.filter())
    });

    let mut guard = TelemetryGuard {
        tracer_provider: None,
        meter_provider: None,
    };
    let mut otel_layer = None;
    let mut export_errors = Vec::new();

    if let Some(endpoint) = &config.otlp_endpoint {
        let resource = config.resource();

        match build_tracer_provider(endpoint, resource.clone()) {
            Ok(provider) => {
                otel_layer =
                    Some(tracing_opentelemetry::layer().with_tracer(provider.tracer("taskrelay")));
                guard.tracer_provider = Some(provider);
            }
            Err(e) => export_errors.push(("traces", e.to_string())),
        }

        match build_meter_provider(endpoint, resource) {
            Ok(provider) => {
                opentelemetry::global::set_meter_provider(provider.clone());
                guard.meter_provider = Some(provider);
            }
            Err(e) => export_errors.push(("metrics", e.to_string())),
        }
    }

    tracing_subscriber::registry()
        .with(console_layer)
        .with(otel_layer)
        .init();

    // Reported only now that the subscriber exists
    for (signal, error) in export_errors {
        tracing::warn!(signal, error = %error, "OTLP export unavailable, continuing without it");
    }
    match &config.otlp_endpoint {
        Some(endpoint) => tracing::info!(endpoint = %endpoint, "OTLP export configured"),
        None => tracing::debug!("OTLP export disabled: OTEL_EXPORTER_OTLP_ENDPOINT not set"),
    }

    guard
}

fn build_tracer_provider(endpoint: &str, resource: Resource) -> Result<SdkTracerProvider, BoxError> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build())
}

fn build_meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, BoxError> {
    let exporter = MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT)
        .build()?;

    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource)
        .build())
}
