//! Integration tests for telemetry initialization and span helpers.

use opentelemetry::KeyValue;
use serde_json::json;
use taskwal::model::{Task, TaskStatus};
use taskwal::telemetry::task::{record_state_transition, start_task_span};
use taskwal::telemetry::{NoopHooks, OtelHooks, TelemetryConfig, TelemetryHooks, metrics};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process; a second
    // init returns Err instead of panicking.
    let guard = taskwal::telemetry::init_telemetry(TelemetryConfig::new("taskwal-test"));
    if let Ok(guard) = guard {
        assert!(!guard.exporting());
        guard.force_flush();
    }
}

#[test]
fn task_span_records_transitions() {
    let task = Task::new("report", json!({ "q": 1 }), None, None).unwrap();
    let span = start_task_span(&task);
    record_state_transition(&span, TaskStatus::Created, TaskStatus::Running);
    record_state_transition(&span, TaskStatus::Running, TaskStatus::Completed);
}

#[test]
fn both_hook_kinds_record_without_a_provider() {
    let hooks: Vec<Box<dyn TelemetryHooks>> = vec![Box::new(NoopHooks), Box::new(OtelHooks)];
    let labels = [KeyValue::new("task", "report")];
    for hooks in &hooks {
        hooks.counter(metrics::TASKS_SUBMITTED, 1, &labels);
        hooks.gauge(metrics::SLOTS_ACTIVE, 2.0, &[]);
        hooks.histogram(metrics::TASK_DURATION_MS, 12.5, &labels);
        let span = hooks.span("recovery.pass", &labels);
        let _enter = span.enter();
    }
}

#[test]
fn instrument_factories_build_every_kind() {
    metrics::counter(metrics::TASKS_SUBMITTED).add(1, &[]);
    metrics::gauge(metrics::QUEUE_PENDING).record(3.0, &[]);
    metrics::histogram(metrics::TASK_DURATION_MS).record(12.5, &[KeyValue::new("task", "report")]);
    metrics::histogram(metrics::SLOTS_ACTIVE).record(1.0, &[]);
}
