//! Quarry Telemetry - Observability Infrastructure
//!
//! Per-operation timing with slow-query detection, a Prometheus sink and
//! tracing subscriber setup. Nothing here is global: monitors and sinks are
//! constructed by the caller and passed where they are needed.

pub mod metrics;
pub mod monitor;
pub mod tracer;

pub use metrics::{gather_text, PrometheusSink};
pub use monitor::{
    operation_key, timed, FanoutSink, MetricsSink, OperationMetrics, PerformanceMonitor,
    SlowQuery, SLOW_QUERY_LOG_LIMIT, SLOW_QUERY_THRESHOLD,
};
pub use tracer::{init_tracing, LogConfig, LOG_JSON_ENV};
