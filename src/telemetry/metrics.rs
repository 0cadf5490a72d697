//! Metric names and OTel instrument factories.
//!
//! The engine reports through [`TelemetryHooks`](super::TelemetryHooks)
//! using the names below; [`OtelHooks`](super::OtelHooks) turns them into
//! instruments on the `"taskwal"` meter.

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Counter: submissions. Labels: `task`, `result` ("created" | "duplicate" | "rejected").
pub const TASKS_SUBMITTED: &str = "taskwal.tasks.submitted";
/// Counter: executions that completed.
pub const TASKS_COMPLETED: &str = "taskwal.tasks.completed";
/// Counter: executions that failed.
pub const TASKS_FAILED: &str = "taskwal.tasks.failed";
/// Counter: executions that were cancelled.
pub const TASKS_CANCELLED: &str = "taskwal.tasks.cancelled";
/// Counter: retry attempts scheduled. Labels: `task`, `rule`.
pub const TASKS_RETRIES: &str = "taskwal.tasks.retries";
/// Counter: tasks moved to the dead letter queue. Labels: `reason`.
pub const TASKS_DEAD_LETTERED: &str = "taskwal.tasks.dead_lettered";
/// Counter: stale tasks recovered. Labels: `strategy`.
pub const TASKS_RECOVERED: &str = "taskwal.tasks.recovered";
/// Histogram: execution duration in milliseconds. Labels: `task`, `status`.
pub const TASK_DURATION_MS: &str = "taskwal.task.duration_ms";
/// Counter: WAL appends. Labels: `type`.
pub const WAL_APPENDS: &str = "taskwal.wal.appends";
/// Counter: entries applied to the repository.
pub const FLUSH_ENTRIES: &str = "taskwal.flush.entries";
/// Counter: failed flush batches.
pub const FLUSH_FAILURES: &str = "taskwal.flush.failures";
/// Gauge: tasks holding an execution slot.
pub const SLOTS_ACTIVE: &str = "taskwal.slots.active";
/// Gauge: admitted tasks waiting to be scheduled.
pub const QUEUE_PENDING: &str = "taskwal.queue.pending";

/// Returns the shared meter for taskwal instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("taskwal")
}

pub fn counter(name: &'static str) -> Counter<u64> {
    meter().u64_counter(name).build()
}

pub fn gauge(name: &'static str) -> Gauge<f64> {
    meter().f64_gauge(name).build()
}

/// Histograms named `*_ms` get a millisecond unit.
pub fn histogram(name: &'static str) -> Histogram<f64> {
    let meter = meter();
    let builder = meter.f64_histogram(name);
    if name.ends_with("_ms") {
        builder.with_unit("ms").build()
    } else {
        builder.build()
    }
}
