//! Logging and OpenTelemetry wiring for the `jobs` binary.
//!
//! Job spans and metric instruments live in the submodules and work whether
//! or not [`init_telemetry`] ran; without a subscriber they are no-ops.

pub mod job;
pub mod metrics;

use std::fmt::Display;

use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::error::{Error, Result};

/// Name reported on every span, metric and log record.
pub const SERVICE_NAME: &str = "jobs-rs";

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint. `None` keeps output on stderr.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: SERVICE_NAME.to_string(),
            log_level: config.log_level.clone(),
        }
    }
}

/// The three OTLP pipelines, built together so a partial setup never leaks.
struct Exporters {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Exporters {
    fn connect(endpoint: &str, service_name: &str) -> Result<Self> {
        use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter, WithExportConfig as _};

        let resource = opentelemetry_sdk::Resource::builder()
            .with_service_name(service_name.to_string())
            .build();

        let spans = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("span"))?;
        let metrics = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("metric"))?;
        let logs = LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("log"))?;

        let exporters = Self {
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
        };
        // Job instruments resolve through the global meter.
        opentelemetry::global::set_meter_provider(exporters.meter.clone());
        Ok(exporters)
    }

    fn flush(&self) {
        let _ = self.tracer.force_flush();
        let _ = self.meter.force_flush();
        let _ = self.logger.force_flush();
    }

    fn shutdown(self) {
        let _ = self.logger.shutdown();
        let _ = self.meter.shutdown();
        let _ = self.tracer.shutdown();
    }
}

fn exporter_error<E: Display>(signal: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

/// Keeps the OTLP pipelines alive. Dropping it flushes and shuts them down.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl TelemetryGuard {
    /// Push everything buffered so far to the collector.
    pub fn force_flush(&self) {
        if let Some(exporters) = &self.exporters {
            exporters.flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(exporters) = self.exporters.take() {
            exporters.shutdown();
        }
    }
}

/// Install the global subscriber: compact stderr output, plus OTLP traces,
/// metrics and logs when an endpoint is configured.
///
/// # Errors
///
/// Fails on an unparsable log level, an exporter that cannot be built, or a
/// subscriber that was already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::Config(format!("invalid log level {:?}: {e}", config.log_level)))?;

    let exporters = config
        .endpoint
        .as_deref()
        .map(|endpoint| Exporters::connect(endpoint, &config.service_name))
        .transpose()?;

    // Absent layers are no-ops.
    let trace_layer = exporters.as_ref().map(|e| {
        tracing_opentelemetry::layer().with_tracer(e.tracer.tracer(SERVICE_NAME))
    });
    let log_layer = exporters.as_ref().map(|e| {
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&e.logger)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard { exporters })
}
