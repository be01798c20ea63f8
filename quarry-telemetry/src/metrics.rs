//! Prometheus Metrics
//!
//! A [`MetricsSink`] that feeds a latency histogram and a slow-operation
//! counter, both labelled by entity and operation. Metrics are registered
//! on a caller-owned [`Registry`] so several adapters (or tests) never
//! collide on the process-global default registry.

use std::time::Duration;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use quarry_core::{QuarryError, QuarryResult};

use crate::monitor::{MetricsSink, SLOW_QUERY_THRESHOLD};

/// Operation latency buckets (seconds)
const OPERATION_LATENCY_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0];

/// Prometheus-backed sink.
#[derive(Clone)]
pub struct PrometheusSink {
    /// Operation duration histogram - labels: entity, operation
    pub operation_duration_seconds: HistogramVec,

    /// Operations slower than the threshold - labels: entity, operation
    pub slow_operations_total: CounterVec,

    threshold: Duration,
}

impl PrometheusSink {
    /// Create the metrics and register them on `registry`.
    pub fn new(registry: &Registry) -> QuarryResult<Self> {
        let operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "quarry_operation_duration_seconds",
                "Data-access operation duration in seconds",
            )
            .buckets(OPERATION_LATENCY_BUCKETS.to_vec()),
            &["entity", "operation"],
        )
        .map_err(|e| metrics_error("quarry_operation_duration_seconds", e))?;

        let slow_operations_total = CounterVec::new(
            Opts::new(
                "quarry_slow_operations_total",
                "Data-access operations slower than the slow-query threshold",
            ),
            &["entity", "operation"],
        )
        .map_err(|e| metrics_error("quarry_slow_operations_total", e))?;

        registry
            .register(Box::new(operation_duration_seconds.clone()))
            .map_err(|e| metrics_error("quarry_operation_duration_seconds", e))?;
        registry
            .register(Box::new(slow_operations_total.clone()))
            .map_err(|e| metrics_error("quarry_slow_operations_total", e))?;

        Ok(Self {
            operation_duration_seconds,
            slow_operations_total,
            threshold: SLOW_QUERY_THRESHOLD,
        })
    }

    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }
}

impl MetricsSink for PrometheusSink {
    fn record(&self, key: &str, duration: Duration) {
        let (entity, operation) = key.split_once(':').unwrap_or((key, ""));
        self.operation_duration_seconds
            .with_label_values(&[entity, operation])
            .observe(duration.as_secs_f64());
        if duration > self.threshold {
            self.slow_operations_total
                .with_label_values(&[entity, operation])
                .inc();
        }
    }
}

/// Render every metric on `registry` in the Prometheus text format.
pub fn gather_text(registry: &Registry) -> QuarryResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to encode metrics");
            QuarryError::config("Failed to encode metrics").with_source(e)
        })?;
    String::from_utf8(buffer)
        .map_err(|e| QuarryError::config("Metrics are not valid UTF-8").with_source(e))
}

fn metrics_error(name: &str, err: prometheus::Error) -> QuarryError {
    QuarryError::config(format!("Failed to register {}", name)).with_source(err)
}
