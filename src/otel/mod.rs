//! OpenTelemetry integration for resilient-sync
//!
//! This module provides observability through OpenTelemetry, including
//! tracing, sync metrics, and optional export to OTLP endpoints.

use crate::config::{LoggingConfig, OtelConfig};
use crate::sync::{ResultSink, SyncResult};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, MeterProvider as _},
    trace::TracerProvider as _,
    KeyValue,
};
use opentelemetry_otlp::{MetricsExporterBuilder, WithExportConfig};
use opentelemetry_sdk::metrics::reader::{DefaultAggregationSelector, DefaultTemporalitySelector};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{self, Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Instrumentation name for spans and meters
const INSTRUMENTATION_NAME: &str = "resilient-sync";

/// OpenTelemetry error types
#[derive(Debug, Error)]
pub enum OtelError {
    /// Export enabled without a collector to send to
    #[error("OTLP endpoint is required when otel export is enabled")]
    MissingEndpoint,

    /// Failed to build the span exporter
    #[error("Failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to build the metrics exporter
    #[error("Failed to initialize meter: {0}")]
    MeterInit(String),

    /// Failed to flush or shut down a provider
    #[error("Failed to shutdown: {0}")]
    Shutdown(String),
}

/// Span and metric providers for the sync daemon
///
/// Metrics are always recorded in-process so [`SyncMetrics`] works the same
/// whether or not export is on. Spans only exist when an OTLP endpoint is
/// configured.
pub struct OtelProvider {
    tracer_provider: Option<TracerProvider>,
    meter_provider: SdkMeterProvider,
}

impl OtelProvider {
    pub fn new(config: &OtelConfig) -> Result<Self, OtelError> {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]);

        if !config.enabled {
            return Ok(Self {
                tracer_provider: None,
                meter_provider: SdkMeterProvider::builder().with_resource(resource).build(),
            });
        }

        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or(OtelError::MissingEndpoint)?;

        let tracer_provider = span_export(endpoint, &resource)?;
        global::set_tracer_provider(tracer_provider.clone());

        Ok(Self {
            tracer_provider: Some(tracer_provider),
            meter_provider: metric_export(endpoint, resource)?,
        })
    }

    /// Tracer feeding the OTLP span exporter, if export is enabled
    pub fn tracer(&self) -> Option<Tracer> {
        self.tracer_provider
            .as_ref()
            .map(|tp| tp.tracer(INSTRUMENTATION_NAME))
    }

    /// Meter for [`SyncMetrics`]
    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(INSTRUMENTATION_NAME)
    }

    /// Flush pending spans and stop the metric reader
    pub fn shutdown(&self) -> Result<(), OtelError> {
        if let Some(tp) = &self.tracer_provider {
            tp.force_flush()
                .into_iter()
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| OtelError::Shutdown(format!("Tracer flush failed: {:?}", e)))?;
        }

        self.meter_provider
            .shutdown()
            .map_err(|e| OtelError::Shutdown(format!("Meter shutdown failed: {:?}", e)))
    }
}

fn span_export(endpoint: &str, resource: &Resource) -> Result<TracerProvider, OtelError> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| OtelError::TracerInit(e.to_string()))?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(trace::Config::default().with_resource(resource.clone()))
        .build())
}

fn metric_export(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, OtelError> {
    let exporter = MetricsExporterBuilder::from(
        opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint),
    )
    .build_metrics_exporter(
        Box::new(DefaultTemporalitySelector::new()),
        Box::new(DefaultAggregationSelector::new()),
    )
    .map_err(|e| OtelError::MeterInit(e.to_string()))?;

    Ok(SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .build())
}

/// Sync metrics, recorded from every emitted [`SyncResult`]
pub struct SyncMetrics {
    /// Attempts by source and outcome
    pub attempts_total: Counter<u64>,

    /// Attempts refused before reaching the handler, by source and reason
    pub rejections_total: Counter<u64>,

    /// Items processed by successful attempts
    pub items_processed_total: Counter<u64>,

    /// Attempt duration in seconds
    pub attempt_duration: Histogram<f64>,
}

impl SyncMetrics {
    /// Create new metrics with the given meter
    pub fn new(meter: &Meter) -> Self {
        let attempts_total = meter
            .u64_counter("resilient_sync_attempts_total")
            .with_description("Total number of sync attempts")
            .init();

        let rejections_total = meter
            .u64_counter("resilient_sync_rejections_total")
            .with_description("Sync attempts rejected by rate limiting or circuit breaking")
            .init();

        let items_processed_total = meter
            .u64_counter("resilient_sync_items_processed_total")
            .with_description("Total number of items processed by successful syncs")
            .init();

        let attempt_duration = meter
            .f64_histogram("resilient_sync_attempt_duration_seconds")
            .with_description("Sync attempt duration in seconds")
            .init();

        Self {
            attempts_total,
            rejections_total,
            items_processed_total,
            attempt_duration,
        }
    }

    /// Record one attempt's outcome
    pub fn record_attempt(&self, source: &str, outcome: &str) {
        self.attempts_total.add(
            1,
            &[
                KeyValue::new("source", source.to_string()),
                KeyValue::new("outcome", outcome.to_string()),
            ],
        );
    }

    /// Record an admission rejection
    pub fn record_rejection(&self, source: &str, reason: &str) {
        self.rejections_total.add(
            1,
            &[
                KeyValue::new("source", source.to_string()),
                KeyValue::new("reason", reason.to_string()),
            ],
        );
    }

    /// Record items processed by a successful attempt
    pub fn record_items(&self, source: &str, items: u64) {
        self.items_processed_total
            .add(items, &[KeyValue::new("source", source.to_string())]);
    }

    /// Record attempt duration
    pub fn record_duration(&self, source: &str, duration_secs: f64) {
        self.attempt_duration
            .record(duration_secs, &[KeyValue::new("source", source.to_string())]);
    }
}

impl ResultSink for SyncMetrics {
    fn on_result(&self, result: &SyncResult) {
        match &result.error {
            None => {
                self.record_attempt(&result.source, "success");
                self.record_items(&result.source, result.items_processed.unwrap_or(0));
                self.record_duration(&result.source, result.duration.as_secs_f64());
            }
            Some(failure) if failure.is_admission_rejection() => {
                self.record_attempt(&result.source, "rejected");
                self.record_rejection(&result.source, failure.reason());
            }
            Some(_) => {
                self.record_attempt(&result.source, "failure");
                self.record_duration(&result.source, result.duration.as_secs_f64());
            }
        }
    }
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize tracing subscriber with OpenTelemetry integration
///
/// `logging.format` selects `pretty` output; anything else logs JSON.
pub fn init_tracing(otel: &OtelProvider, logging: &LoggingConfig) -> Result<(), OtelError> {
    let filter = tracing_subscriber::filter::LevelFilter::from_level(parse_level(&logging.level));

    let fmt_layer = if logging.format.eq_ignore_ascii_case("pretty") {
        tracing_subscriber::fmt::layer().pretty().boxed()
    } else {
        tracing_subscriber::fmt::layer().json().boxed()
    };

    let otel_layer = otel
        .tracer()
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(filter)
        .try_init()
        .map_err(|e| OtelError::TracerInit(e.to_string()))
}
