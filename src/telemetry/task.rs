//! Task execution span helpers.

use tracing::Span;

use crate::model::{Task, TaskStatus};

/// Starts the `task.execute` span for one execution.
///
/// `task.status` is declared empty and updated by
/// [`record_state_transition`].
pub fn start_task_span(task: &Task) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.name" = %task.name,
        "task.id" = %task.id,
        "task.idempotency_key" = %task.idempotency_key,
        "task.type" = %task.task_type,
        "task.status" = tracing::field::Empty,
    )
}

/// Records a transition on the span and emits an `info` event inside it.
pub fn record_state_transition(span: &Span, from: TaskStatus, to: TaskStatus) {
    span.record("task.status", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}
