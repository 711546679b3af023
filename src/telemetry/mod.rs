//! OpenTelemetry initialization for the scheduler process.
//!
//! Sets up tracing-subscriber with an env filter. With an OTLP endpoint the
//! work spans, scheduler metrics and logs are exported there, tagged with
//! the database the scheduler serves; otherwise logs go to stderr only.

pub mod metrics;
pub mod work;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::config::Config;
use crate::error::{Error, Result};

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// Filter directive used when `RUST_LOG` is unset (e.g. "info").
    pub log_level: String,
    /// Optional OTLP endpoint (e.g. "http://localhost:4317").
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Attached to every exported signal.
    pub resource_attributes: Vec<KeyValue>,
}

impl TelemetryConfig {
    /// Settings for a scheduler serving `config.database_path`.
    pub fn for_scheduler(config: &Config) -> Self {
        Self {
            log_level: config.log_level.clone(),
            endpoint: config.otel_endpoint.clone(),
            service_name: "backwork".to_string(),
            resource_attributes: vec![
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                KeyValue::new(
                    "backwork.database",
                    config.database_path.display().to_string(),
                ),
                KeyValue::new(
                    "backwork.max_concurrent_running",
                    config.scheduler.max_concurrent_running as i64,
                ),
            ],
        }
    }
}

struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

/// Keeps the OTLP pipelines alive. Dropping it shuts them down; call
/// [`flush`](TelemetryGuard::flush) first to export what is buffered.
pub struct TelemetryGuard {
    providers: Option<Providers>,
}

impl TelemetryGuard {
    /// Whether signals leave the process.
    pub fn is_exporting(&self) -> bool {
        self.providers.is_some()
    }

    /// Export buffered spans, metrics and logs. Without an endpoint this
    /// does nothing.
    pub fn flush(&self) -> Result<()> {
        let Some(providers) = &self.providers else {
            return Ok(());
        };
        let failures: Vec<String> = [
            providers.tracer.force_flush().err().map(|e| format!("traces: {e}")),
            providers.meter.force_flush().err().map(|e| format!("metrics: {e}")),
            providers.logger.force_flush().err().map(|e| format!("logs: {e}")),
        ]
        .into_iter()
        .flatten()
        .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "telemetry flush failed: {}",
                failures.join(", ")
            )))
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(providers) = self.providers.take() {
            let _ = providers.logger.shutdown();
            let _ = providers.meter.shutdown();
            let _ = providers.tracer.shutdown();
        }
    }
}

/// Initialize tracing, and with an endpoint the OTLP pipelines.
///
/// # Errors
///
/// Returns an error if an OTLP exporter fails to build or a global
/// subscriber is already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;
        return Ok(TelemetryGuard { providers: None });
    };

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes(config.resource_attributes.clone())
        .build();
    let providers = otlp_providers(endpoint, resource)?;
    opentelemetry::global::set_meter_provider(providers.meter.clone());

    let tracer = providers.tracer.tracer("backwork");
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(
            opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
                &providers.logger,
            ),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard {
        providers: Some(providers),
    })
}

fn otlp_providers(endpoint: &str, resource: Resource) -> Result<Providers> {
    use opentelemetry_otlp::WithExportConfig as _;

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("failed to create OTLP span exporter: {e}")))?;
    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("failed to create OTLP metric exporter: {e}")))?;
    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("failed to create OTLP log exporter: {e}")))?;

    Ok(Providers {
        tracer: SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build(),
        meter: SdkMeterProvider::builder()
            .with_periodic_exporter(metrics)
            .with_resource(resource.clone())
            .build(),
        logger: SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource)
            .build(),
    })
}
