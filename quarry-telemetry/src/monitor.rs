//! Query Performance Monitor
//!
//! Collects `(entity:operation, duration)` samples, computes per-key
//! aggregates on demand and keeps a log of slow samples.
//!
//! Per-key duration history is never trimmed. Long-running processes with
//! many distinct keys grow without bound; callers that need a ceiling
//! should feed a [`PrometheusSink`](crate::PrometheusSink) instead, whose
//! histograms are fixed-size.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// Samples slower than this are logged as slow queries.
pub const SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(1000);

/// Slow queries returned by [`PerformanceMonitor::slow_queries`].
pub const SLOW_QUERY_LOG_LIMIT: usize = 100;

/// Receiver of operation timings.
pub trait MetricsSink: Send + Sync {
    /// Record one sample for `key` (`entity:operation`).
    fn record(&self, key: &str, duration: Duration);
}

impl<T: MetricsSink + ?Sized> MetricsSink for Arc<T> {
    fn record(&self, key: &str, duration: Duration) {
        (**self).record(key, duration)
    }
}

/// Aggregates for one `entity:operation` key, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationMetrics {
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

/// A sample that exceeded the slow threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowQuery {
    pub key: String,
    pub duration_ms: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
struct MonitorState {
    durations: HashMap<String, Vec<f64>>,
    slow: Vec<SlowQuery>,
}

/// In-process performance monitor.
///
/// Cloning is cheap and clones share state, so one monitor can be handed to
/// every component that records timings.
#[derive(Clone)]
pub struct PerformanceMonitor {
    state: Arc<Mutex<MonitorState>>,
    threshold: Duration,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::with_threshold(SLOW_QUERY_THRESHOLD)
    }

    pub fn with_threshold(threshold: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MonitorState::default())),
            threshold,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Record the time elapsed since `start` under `entity:operation`.
    pub fn track_query(&self, entity: &str, operation: &str, start: Instant) -> Duration {
        let elapsed = start.elapsed();
        self.record(&operation_key(entity, operation), elapsed);
        elapsed
    }

    /// Count, average, min and max per key, computed now.
    pub fn metrics(&self) -> BTreeMap<String, OperationMetrics> {
        let state = self.state.lock();
        state
            .durations
            .iter()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(key, samples)| {
                let sum: f64 = samples.iter().sum();
                let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
                let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                (
                    key.clone(),
                    OperationMetrics {
                        count: samples.len(),
                        avg_ms: sum / samples.len() as f64,
                        min_ms: min,
                        max_ms: max,
                    },
                )
            })
            .collect()
    }

    /// The most recent slow samples, oldest first, at most
    /// [`SLOW_QUERY_LOG_LIMIT`].
    pub fn slow_queries(&self) -> Vec<SlowQuery> {
        let state = self.state.lock();
        let skip = state.slow.len().saturating_sub(SLOW_QUERY_LOG_LIMIT);
        state.slow[skip..].to_vec()
    }

    /// Drop all recorded samples.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.durations.clear();
        state.slow.clear();
    }
}

impl MetricsSink for PerformanceMonitor {
    fn record(&self, key: &str, duration: Duration) {
        let ms = duration.as_secs_f64() * 1000.0;
        let slow = duration > self.threshold;
        {
            let mut state = self.state.lock();
            state.durations.entry(key.to_string()).or_default().push(ms);
            if slow {
                state.slow.push(SlowQuery {
                    key: key.to_string(),
                    duration_ms: ms,
                    recorded_at: Utc::now(),
                });
            }
        }
        if slow {
            warn!(target: "quarry::monitor", key, duration_ms = ms, "Slow query");
        }
    }
}

/// Forwards every sample to several sinks.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for FanoutSink {
    fn record(&self, key: &str, duration: Duration) {
        for sink in &self.sinks {
            sink.record(key, duration);
        }
    }
}

/// Await `future` and record how long it took under `entity:operation`.
///
/// The sample is recorded whether the future resolves to success or error.
pub async fn timed<S, F, T>(sink: &S, entity: &str, operation: &str, future: F) -> T
where
    S: MetricsSink + ?Sized,
    F: Future<Output = T>,
{
    let start = Instant::now();
    let output = future.await;
    sink.record(&operation_key(entity, operation), start.elapsed());
    output
}

pub fn operation_key(entity: &str, operation: &str) -> String {
    format!("{}:{}", entity, operation)
}
