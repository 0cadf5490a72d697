//! Observability hooks the engine calls into.

use opentelemetry::KeyValue;
use tracing::Span;

use super::metrics;

/// Every method defaults to a no-op, so the engine runs fine with
/// [`NoopHooks`].
pub trait TelemetryHooks: Send + Sync {
    fn counter(&self, _name: &'static str, _value: u64, _attributes: &[KeyValue]) {}

    fn gauge(&self, _name: &'static str, _value: f64, _attributes: &[KeyValue]) {}

    fn histogram(&self, _name: &'static str, _value: f64, _attributes: &[KeyValue]) {}

    /// A span wrapping some unit of engine work.
    fn span(&self, _name: &'static str, _attributes: &[KeyValue]) -> Span {
        Span::none()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl TelemetryHooks for NoopHooks {}

/// Records through the global OpenTelemetry meter and `tracing` spans.
#[derive(Debug, Clone, Copy, Default)]
pub struct OtelHooks;

impl TelemetryHooks for OtelHooks {
    fn counter(&self, name: &'static str, value: u64, attributes: &[KeyValue]) {
        metrics::counter(name).add(value, attributes);
    }

    fn gauge(&self, name: &'static str, value: f64, attributes: &[KeyValue]) {
        metrics::gauge(name).record(value, attributes);
    }

    fn histogram(&self, name: &'static str, value: f64, attributes: &[KeyValue]) {
        metrics::histogram(name).record(value, attributes);
    }

    fn span(&self, name: &'static str, attributes: &[KeyValue]) -> Span {
        let span = tracing::info_span!("engine", otel.name = name, attributes = tracing::field::Empty);
        if !attributes.is_empty() {
            let rendered = attributes
                .iter()
                .map(|kv| format!("{}={}", kv.key, kv.value))
                .collect::<Vec<_>>()
                .join(",");
            span.record("attributes", rendered.as_str());
        }
        span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_hooks_do_nothing() {
        let hooks = NoopHooks;
        hooks.counter(metrics::TASKS_SUBMITTED, 1, &[KeyValue::new("task", "echo")]);
        hooks.histogram(metrics::TASK_DURATION_MS, 12.0, &[]);
        assert!(hooks.span("x", &[]).is_none());
    }

    #[test]
    fn otel_hooks_without_provider_are_harmless() {
        let hooks = OtelHooks;
        hooks.counter(metrics::WAL_APPENDS, 1, &[KeyValue::new("type", "TASK_START")]);
        hooks.gauge(metrics::SLOTS_ACTIVE, 3.0, &[]);
    }
}
