//! Queryable task store fed by the flush worker.
//!
//! The WAL is the source of truth; a [`TaskRepository`] holds the applied
//! view of it: one snapshot row per task plus every non-heartbeat event in
//! seq order. Both backends apply batches with the same rules (see
//! [`apply_entry`]) so they are interchangeable.

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::event::TaskEvent;
use crate::model::{IdempotencyKey, Task, TaskId, TaskStatus, TaskType, UserId};
use crate::wal::{EventLogEntry, EventLogEntryType, EventLogEvent};

pub use memory::InMemoryTaskRepository;
pub use sqlite::SqliteTaskRepository;

/// An event as stored by a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub event_id: String,
    pub task_id: TaskId,
    pub idempotency_key: IdempotencyKey,
    /// WAL seq the event was flushed from.
    pub seq: u64,
    pub entry_type: EventLogEntryType,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl StoredEvent {
    pub fn from_log_event(event: &EventLogEvent) -> Self {
        Self {
            event_id: event.entry.event_id.clone(),
            task_id: event.entry.task_id.clone(),
            idempotency_key: event.entry.idempotency_key.clone(),
            seq: event.seq,
            entry_type: event.entry.entry_type,
            timestamp: event.entry.timestamp,
            payload: event.entry.payload.clone(),
        }
    }

    pub fn to_log_entry(&self) -> EventLogEntry {
        EventLogEntry {
            entry_type: self.entry_type,
            task_id: self.task_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
            event_id: self.event_id.clone(),
            timestamp: self.timestamp,
            payload: self.payload.clone(),
        }
    }

    pub fn to_task_event(&self) -> Result<TaskEvent> {
        TaskEvent::from_log_entry(&self.to_log_entry())
    }
}

#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Prepares the backing store (schema, connections).
    async fn initialize(&self) -> Result<()>;

    /// Applies WAL entries in one transaction: all or nothing.
    async fn execute_batch(&self, entries: &[EventLogEvent]) -> Result<()>;

    async fn find_by_id(&self, id: &TaskId) -> Result<Option<Task>>;

    /// The most recently created task with this key.
    async fn find_by_idempotency_key(&self, key: &IdempotencyKey) -> Result<Option<Task>>;

    /// Running tasks whose last heartbeat (or start) is older than
    /// `now - threshold`.
    async fn find_stale_tasks(&self, threshold: Duration) -> Result<Vec<Task>>;

    /// Stored events of a task in seq order.
    async fn get_events(&self, task_id: &TaskId) -> Result<Vec<StoredEvent>>;

    async fn health_check(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Batch application rules
// ---------------------------------------------------------------------------

fn payload_str(payload: &Value, field: &str) -> Option<String> {
    payload.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Builds the snapshot a `TASK_CREATED` entry describes.
pub fn task_from_created(entry: &EventLogEntry) -> Result<Task> {
    if entry.entry_type != EventLogEntryType::TaskCreated {
        return Err(Error::Validation(format!(
            "expected TASK_CREATED, got {}",
            entry.entry_type
        )));
    }
    let p = &entry.payload;
    let name = payload_str(p, "name")
        .ok_or_else(|| Error::Validation(format!("created event {} has no name", entry.event_id)))?;
    let user_id = payload_str(p, "userId").map(UserId::new).transpose()?;
    let task_type = match payload_str(p, "taskType") {
        Some(t) => t.parse()?,
        None if user_id.is_some() => TaskType::User,
        None => TaskType::Background,
    };
    Ok(Task {
        id: entry.task_id.clone(),
        name,
        input: p.get("input").cloned().unwrap_or(Value::Null),
        user_id,
        idempotency_key: entry.idempotency_key.clone(),
        task_type,
        created_at: entry.timestamp,
        status: TaskStatus::Created,
        started_at: None,
        completed_at: None,
        last_heartbeat_at: None,
        attempt: 0,
        result: None,
        error: None,
    })
}

/// Applies one non-`CREATED` entry to a stored snapshot.
///
/// Snapshots mirror the log rather than enforce the state machine, so
/// fields are assigned directly.
pub fn apply_entry(task: &mut Task, entry: &EventLogEntry) {
    let p = &entry.payload;
    let at = entry.timestamp;
    match entry.entry_type {
        EventLogEntryType::TaskCreated => {}
        EventLogEntryType::TaskStart => {
            task.status = TaskStatus::Running;
            task.started_at.get_or_insert(at);
            if let Some(attempt) = p.get("attempt").and_then(Value::as_u64) {
                task.attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
            }
            task.last_heartbeat_at = Some(at);
            task.completed_at = None;
            task.result = None;
            task.error = None;
        }
        EventLogEntryType::TaskHeartbeat => {
            task.last_heartbeat_at = Some(at);
        }
        EventLogEntryType::TaskComplete => {
            match payload_str(p, "status").map(|s| s.parse::<TaskStatus>()) {
                Some(Ok(status)) => task.status = status,
                _ => {
                    warn!(event_id = %entry.event_id, "complete event without a valid status");
                    task.status = TaskStatus::Completed;
                }
            }
            task.result = p.get("result").filter(|v| !v.is_null()).cloned();
            if let Some(error) = payload_str(p, "error") {
                task.error = Some(error);
            }
            task.completed_at = Some(at);
        }
        EventLogEntryType::TaskError => {
            task.error = payload_str(p, "message");
        }
        EventLogEntryType::TaskCancelled => {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(at);
        }
        EventLogEntryType::TaskProgress | EventLogEntryType::TaskCustom => {}
    }
}

/// Whether an entry is kept in the queryable event table.
pub fn is_stored_event(entry_type: EventLogEntryType) -> bool {
    entry_type != EventLogEntryType::TaskHeartbeat
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(entry_type: EventLogEntryType, payload: Value) -> EventLogEntry {
        EventLogEntry {
            entry_type,
            task_id: TaskId::new("t-1").unwrap(),
            idempotency_key: IdempotencyKey::new("k-1").unwrap(),
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    #[test]
    fn created_then_lifecycle() {
        let created = entry(
            EventLogEntryType::TaskCreated,
            json!({"name": "echo", "input": {"x": 1}, "userId": "alice", "taskType": "user"}),
        );
        let mut task = task_from_created(&created).unwrap();
        assert_eq!(task.task_type, TaskType::User);
        assert_eq!(task.user_id.as_ref().map(UserId::as_str), Some("alice"));

        apply_entry(&mut task, &entry(EventLogEntryType::TaskStart, json!({"attempt": 1})));
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.attempt, 1);

        apply_entry(
            &mut task,
            &entry(
                EventLogEntryType::TaskComplete,
                json!({"status": "completed", "result": {"x": 1}, "error": null, "durationMs": 3}),
            ),
        );
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({"x": 1})));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn heartbeats_are_not_stored() {
        assert!(!is_stored_event(EventLogEntryType::TaskHeartbeat));
        assert!(is_stored_event(EventLogEntryType::TaskProgress));
    }
}
