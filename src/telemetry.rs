//! Telemetry sinks consumed by the messaging core.
//!
//! The core never talks to a metrics backend or trace exporter directly.
//! It receives a [`MetricsSink`] and a [`TracePropagator`] at construction.
//! No-op implementations are the defaults; the `otel` feature adds
//! OpenTelemetry-backed ones.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::collections::HashMap;
use std::sync::Arc;

/// Total messages published, labeled subject/type/outcome.
pub const PUBLISHED_TOTAL: &str = "courier.messages.published.total";
/// Publish duration in seconds, labeled subject/type.
pub const PUBLISH_DURATION: &str = "courier.messages.publish.duration";
/// Total messages received, labeled subject/type/outcome.
pub const RECEIVED_TOTAL: &str = "courier.messages.received.total";
/// Handler duration in seconds, labeled subject/type.
pub const RECEIVE_DURATION: &str = "courier.messages.receive.duration";

/// A metric label.
pub type Label = (&'static str, String);

/// Create a subject label.
pub fn subject_label(subject: &str) -> Label {
    ("subject", subject.to_string())
}

/// Create a message type label.
pub fn type_label(message_type: &str) -> Label {
    ("type", message_type.to_string())
}

/// Create an outcome label.
pub fn outcome_label(success: bool) -> Label {
    ("outcome", if success { "success" } else { "error" }.to_string())
}

/// Destination for counters and histograms.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &'static str, labels: &[Label]);

    fn observe_histogram(&self, name: &'static str, value: f64, labels: &[Label]);
}

/// Discards every measurement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &'static str, _labels: &[Label]) {}

    fn observe_histogram(&self, _name: &'static str, _value: f64, _labels: &[Label]) {}
}

/// Moves trace context between spans and envelope metadata.
pub trait TracePropagator: Send + Sync {
    /// Write the context of `span` into `carrier`.
    fn inject(&self, span: &tracing::Span, carrier: &mut HashMap<String, String>);

    /// Parent `span` on the context found in `carrier`, if any.
    fn extract(&self, carrier: &HashMap<String, String>, span: &tracing::Span);
}

/// Propagates nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPropagator;

impl TracePropagator for NoopPropagator {
    fn inject(&self, _span: &tracing::Span, _carrier: &mut HashMap<String, String>) {}

    fn extract(&self, _carrier: &HashMap<String, String>, _span: &tracing::Span) {}
}

/// Sinks shared by publisher, subscriber and middleware.
#[derive(Clone)]
pub struct Telemetry {
    pub metrics: Arc<dyn MetricsSink>,
    pub propagator: Arc<dyn TracePropagator>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            metrics: Arc::new(NoopMetrics),
            propagator: Arc::new(NoopPropagator),
        }
    }
}

impl Telemetry {
    pub fn new(metrics: Arc<dyn MetricsSink>, propagator: Arc<dyn TracePropagator>) -> Self {
        Self {
            metrics,
            propagator,
        }
    }

    /// OpenTelemetry metrics and W3C propagation via the global providers.
    #[cfg(feature = "otel")]
    pub fn otel() -> Self {
        Self::new(Arc::new(otel::OtelMetrics::new()), Arc::new(otel::OtelPropagator))
    }
}

#[cfg(feature = "otel")]
pub use otel::{OtelMetrics, OtelPropagator};

#[cfg(feature = "otel")]
mod otel {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use opentelemetry::metrics::{Counter, Histogram, Meter};
    use opentelemetry::{global, KeyValue};
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    use super::{Label, MetricsSink, TracePropagator};

    fn attributes(labels: &[Label]) -> Vec<KeyValue> {
        labels
            .iter()
            .map(|(key, value)| KeyValue::new(*key, value.clone()))
            .collect()
    }

    /// Metrics recorded through the global OpenTelemetry meter provider.
    ///
    /// Instruments are created once per metric name and reused.
    pub struct OtelMetrics {
        meter: Meter,
        counters: Mutex<HashMap<&'static str, Counter<u64>>>,
        histograms: Mutex<HashMap<&'static str, Histogram<f64>>>,
    }

    impl Default for OtelMetrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl OtelMetrics {
        pub fn new() -> Self {
            Self {
                meter: global::meter("courier"),
                counters: Mutex::new(HashMap::new()),
                histograms: Mutex::new(HashMap::new()),
            }
        }
    }

    impl MetricsSink for OtelMetrics {
        fn increment_counter(&self, name: &'static str, labels: &[Label]) {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters
                .entry(name)
                .or_insert_with(|| self.meter.u64_counter(name).build())
                .add(1, &attributes(labels));
        }

        fn observe_histogram(&self, name: &'static str, value: f64, labels: &[Label]) {
            let mut histograms = self.histograms.lock().unwrap_or_else(|e| e.into_inner());
            histograms
                .entry(name)
                .or_insert_with(|| self.meter.f64_histogram(name).with_unit("s").build())
                .record(value, &attributes(labels));
        }
    }

    /// W3C trace context through the global text map propagator.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct OtelPropagator;

    impl TracePropagator for OtelPropagator {
        fn inject(&self, span: &tracing::Span, carrier: &mut HashMap<String, String>) {
            let cx = span.context();
            global::get_text_map_propagator(|propagator| {
                propagator.inject_context(&cx, carrier);
            });
        }

        fn extract(&self, carrier: &HashMap<String, String>, span: &tracing::Span) {
            if carrier.is_empty() {
                return;
            }
            let parent = global::get_text_map_propagator(|propagator| propagator.extract(carrier));
            span.set_parent(parent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(subject_label("orders.created").1, "orders.created");
        assert_eq!(type_label("order.created").0, "type");
        assert_eq!(outcome_label(true).1, "success");
        assert_eq!(outcome_label(false).1, "error");
    }

    #[test]
    fn test_noop_propagator_leaves_carrier_empty() {
        let mut carrier = HashMap::new();
        NoopPropagator.inject(&tracing::Span::current(), &mut carrier);
        assert!(carrier.is_empty());
    }
}
