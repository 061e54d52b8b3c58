//! Metrics collaborator for adapters
//!
//! Adapters report two things per inbound message: how long a successful
//! dispatch took, or that processing failed. The [`Metrics`] trait is the
//! seam; [`AdapterMetrics`] keeps in-process counters per
//! `(event source, event)` pair and the `metrics` feature adds a Prometheus
//! registry implementation.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for per-message processing metrics
pub trait Metrics: Send + Sync {
    /// Record the duration of a successful dispatch
    fn event_processing_duration(&self, event_source_name: &str, event_name: &str, millis: f64);

    /// Record a failed message (serialize or dispatch)
    fn event_processing_failed(&self, event_source_name: &str, event_name: &str);
}

/// Metrics sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn event_processing_duration(&self, _: &str, _: &str, _: f64) {}

    fn event_processing_failed(&self, _: &str, _: &str) {}
}

#[derive(Debug, Default)]
struct EventCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    /// Accumulated dispatch time in microseconds
    duration_us: AtomicU64,
}

/// Point-in-time view of one event's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetricsSnapshot {
    /// Messages dispatched successfully
    pub processed: u64,
    /// Messages that failed processing
    pub failed: u64,
    /// Mean successful dispatch time in milliseconds
    pub avg_duration_ms: f64,
}

/// In-process counters keyed by `(event source, event)`
#[derive(Debug, Default)]
pub struct AdapterMetrics {
    events: DashMap<(String, String), EventCounters>,
}

impl AdapterMetrics {
    /// Create an empty metrics store
    pub fn new() -> Self {
        Self::default()
    }

    fn with_counters<F>(&self, event_source_name: &str, event_name: &str, f: F)
    where
        F: FnOnce(&EventCounters),
    {
        let key = (event_source_name.to_string(), event_name.to_string());
        let entry = self.events.entry(key).or_default();
        f(entry.value());
    }

    /// Counters for one event, zeroed if nothing was recorded yet
    pub fn snapshot(&self, event_source_name: &str, event_name: &str) -> EventMetricsSnapshot {
        let key = (event_source_name.to_string(), event_name.to_string());
        match self.events.get(&key) {
            Some(counters) => {
                let processed = counters.processed.load(Ordering::Relaxed);
                let duration_us = counters.duration_us.load(Ordering::Relaxed);
                EventMetricsSnapshot {
                    processed,
                    failed: counters.failed.load(Ordering::Relaxed),
                    avg_duration_ms: if processed == 0 {
                        0.0
                    } else {
                        duration_us as f64 / processed as f64 / 1000.0
                    },
                }
            }
            None => EventMetricsSnapshot::default(),
        }
    }

    /// Total failures across all events
    pub fn total_failed(&self) -> u64 {
        self.events
            .iter()
            .map(|entry| entry.value().failed.load(Ordering::Relaxed))
            .sum()
    }
}

impl Metrics for AdapterMetrics {
    fn event_processing_duration(&self, event_source_name: &str, event_name: &str, millis: f64) {
        let micros = (millis.max(0.0) * 1000.0).round() as u64;
        self.with_counters(event_source_name, event_name, |c| {
            c.processed.fetch_add(1, Ordering::Relaxed);
            c.duration_us.fetch_add(micros, Ordering::Relaxed);
        });
        tracing::trace!(event_source_name, event_name, millis, "event processing duration");
    }

    fn event_processing_failed(&self, event_source_name: &str, event_name: &str) {
        self.with_counters(event_source_name, event_name, |c| {
            c.failed.fetch_add(1, Ordering::Relaxed);
        });
    }
}

#[cfg(feature = "metrics")]
pub use prometheus_metrics::PrometheusMetrics;

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use super::Metrics;
    use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

    const LABELS: &[&str] = &["event_source_name", "event_name"];

    /// Prometheus-backed metrics sink
    #[derive(Clone)]
    pub struct PrometheusMetrics {
        duration: HistogramVec,
        failed: IntCounterVec,
    }

    impl PrometheusMetrics {
        /// Create the collectors and register them with `registry`
        pub fn register(registry: &Registry) -> prometheus::Result<Self> {
            let duration = HistogramVec::new(
                HistogramOpts::new(
                    "eventsource_processing_duration_ms",
                    "Time taken to dispatch one event, in milliseconds",
                )
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
                LABELS,
            )?;
            let failed = IntCounterVec::new(
                Opts::new(
                    "eventsource_processing_failed_total",
                    "Events that failed serialization or dispatch",
                ),
                LABELS,
            )?;
            registry.register(Box::new(duration.clone()))?;
            registry.register(Box::new(failed.clone()))?;
            Ok(Self { duration, failed })
        }
    }

    impl Metrics for PrometheusMetrics {
        fn event_processing_duration(&self, event_source_name: &str, event_name: &str, millis: f64) {
            self.duration
                .with_label_values(&[event_source_name, event_name])
                .observe(millis);
        }

        fn event_processing_failed(&self, event_source_name: &str, event_name: &str) {
            self.failed
                .with_label_values(&[event_source_name, event_name])
                .inc();
        }
    }
}
