//! EventSink (C2): the write-only logging/metrics capability consumed by
//! every other component. Calls must never raise; the core treats the
//! sink as best-effort, matching the teacher's `tracing`-based logging
//! plus a `prometheus` counter/gauge registry.

use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::{error, info, warn};

/// A single structured field attached to a log event.
pub type Fields<'a> = &'a [(&'a str, &'a str)];

/// Write-only logging/metrics interface. Implementations must not panic or
/// block the caller for long; the core never inspects return values.
pub trait EventSink: Send + Sync {
    fn info(&self, event: &str, fields: Fields);
    fn warn(&self, event: &str, fields: Fields);
    fn error(&self, event: &str, fields: Fields);
    fn counter(&self, name: &str, delta: i64, labels: Fields);
    fn gauge(&self, name: &str, value: f64, labels: Fields);
}

fn fmt_fields(fields: Fields) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Default `EventSink`: structured `tracing` events plus a Prometheus
/// registry exposed via [`TracingEventSink::render_metrics`].
pub struct TracingEventSink {
    registry: Registry,
    counters: dashmap::DashMap<String, IntCounterVec>,
    gauges: dashmap::DashMap<String, GaugeVec>,
}

impl TracingEventSink {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            counters: dashmap::DashMap::new(),
            gauges: dashmap::DashMap::new(),
        }
    }

    fn label_names(labels: Fields) -> Vec<&str> {
        labels.iter().map(|(k, _)| *k).collect()
    }

    fn counter_for(&self, name: &str, labels: Fields) -> IntCounterVec {
        if let Some(existing) = self.counters.get(name) {
            return existing.clone();
        }
        let label_names = Self::label_names(labels);
        let metric = IntCounterVec::new(Opts::new(name, name), &label_names)
            .expect("valid counter metric name");
        let _ = self.registry.register(Box::new(metric.clone()));
        self.counters.insert(name.to_string(), metric.clone());
        metric
    }

    fn gauge_for(&self, name: &str, labels: Fields) -> GaugeVec {
        if let Some(existing) = self.gauges.get(name) {
            return existing.clone();
        }
        let label_names = Self::label_names(labels);
        let metric =
            GaugeVec::new(Opts::new(name, name), &label_names).expect("valid gauge metric name");
        let _ = self.registry.register(Box::new(metric.clone()));
        self.gauges.insert(name.to_string(), metric.clone());
        metric
    }

    /// Render the current metric set in Prometheus text exposition format,
    /// for the (external) health/metrics sink to scrape.
    pub fn render_metrics(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for TracingEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for TracingEventSink {
    fn info(&self, event: &str, fields: Fields) {
        info!(target: "sentrymesh", fields = %fmt_fields(fields), "{event}");
    }

    fn warn(&self, event: &str, fields: Fields) {
        warn!(target: "sentrymesh", fields = %fmt_fields(fields), "{event}");
    }

    fn error(&self, event: &str, fields: Fields) {
        error!(target: "sentrymesh", fields = %fmt_fields(fields), "{event}");
    }

    fn counter(&self, name: &str, delta: i64, labels: Fields) {
        let values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();
        let metric = self.counter_for(name, labels);
        if delta >= 0 {
            metric.with_label_values(&values).inc_by(delta as u64);
        }
    }

    fn gauge(&self, name: &str, value: f64, labels: Fields) {
        let values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();
        let metric = self.gauge_for(name, labels);
        metric.with_label_values(&values).set(value);
    }
}

/// A no-op sink useful for tests that don't care about observability.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn info(&self, _event: &str, _fields: Fields) {}
    fn warn(&self, _event: &str, _fields: Fields) {}
    fn error(&self, _event: &str, _fields: Fields) {}
    fn counter(&self, _name: &str, _delta: i64, _labels: Fields) {}
    fn gauge(&self, _name: &str, _value: f64, _labels: Fields) {}
}

/// Shared handle type passed to every component at construction.
pub type SharedEventSink = Arc<dyn EventSink>;
