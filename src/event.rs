//! Task events: immutable facts about a task's progress.
//!
//! Events are what the executor emits. A subset is written to the WAL (see
//! [`TaskEvent::to_log_entry`]) and everything except heartbeats is pushed to
//! the task's stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{IdempotencyKey, Task, TaskId, TaskStatus, TaskType, UserId};
use crate::wal::{EventLogEntry, EventLogEntryType};

/// A single event in a task's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    /// Unique event id. Repositories key stored events by it.
    pub id: String,
    pub task_id: TaskId,
    pub idempotency_key: IdempotencyKey,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TaskEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TaskEventKind {
    Created {
        name: String,
        input: Value,
        user_id: Option<UserId>,
        task_type: TaskType,
    },
    Start {
        attempt: u32,
    },
    Progress {
        data: Value,
    },
    Complete {
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
        duration_ms: u64,
    },
    Error {
        message: String,
        retryable: bool,
        attempt: u32,
    },
    Cancelled {
        reason: Option<String>,
    },
    Heartbeat,
    Retry {
        attempt: u32,
        next_attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Recovered {
        strategy: RecoveryStrategy,
        previous_events: usize,
        reason: String,
    },
    Custom {
        name: String,
        data: Value,
    },
}

/// How a stale task was brought back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// The definition's `recover` handler inspected the history.
    Smart,
    /// No recover handler; the normal handler ran again from scratch.
    Reexecute,
}

impl TaskEventKind {
    /// `created`, carrying what is needed to rebuild the task.
    pub fn created(task: &Task) -> Self {
        TaskEventKind::Created {
            name: task.name.clone(),
            input: task.input.clone(),
            user_id: task.user_id.clone(),
            task_type: task.task_type,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskEventKind::Created { .. } => "created",
            TaskEventKind::Start { .. } => "start",
            TaskEventKind::Progress { .. } => "progress",
            TaskEventKind::Complete { .. } => "complete",
            TaskEventKind::Error { .. } => "error",
            TaskEventKind::Cancelled { .. } => "cancelled",
            TaskEventKind::Heartbeat => "heartbeat",
            TaskEventKind::Retry { .. } => "retry",
            TaskEventKind::Recovered { .. } => "recovered",
            TaskEventKind::Custom { .. } => "custom",
        }
    }

    /// WAL record type, or `None` for events that are never persisted.
    pub fn log_type(&self) -> Option<EventLogEntryType> {
        match self {
            TaskEventKind::Created { .. } => Some(EventLogEntryType::TaskCreated),
            TaskEventKind::Start { .. } => Some(EventLogEntryType::TaskStart),
            TaskEventKind::Progress { .. } => Some(EventLogEntryType::TaskProgress),
            TaskEventKind::Complete { .. } => Some(EventLogEntryType::TaskComplete),
            TaskEventKind::Error { .. } => Some(EventLogEntryType::TaskError),
            TaskEventKind::Cancelled { .. } => Some(EventLogEntryType::TaskCancelled),
            TaskEventKind::Heartbeat => Some(EventLogEntryType::TaskHeartbeat),
            TaskEventKind::Custom { .. } => Some(EventLogEntryType::TaskCustom),
            TaskEventKind::Retry { .. } | TaskEventKind::Recovered { .. } => None,
        }
    }

    /// `complete` and `cancelled` end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEventKind::Complete { .. } | TaskEventKind::Cancelled { .. }
        )
    }

    /// The variant's fields without the `type` tag.
    fn payload(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("type");
        }
        Ok(value)
    }
}

impl TaskEvent {
    pub fn new(task: &Task, kind: TaskEventKind) -> Self {
        Self::for_task(task.id.clone(), task.idempotency_key.clone(), kind)
    }

    pub fn for_task(task_id: TaskId, idempotency_key: IdempotencyKey, kind: TaskEventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id,
            idempotency_key,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// The `created` event for a freshly admitted task.
    pub fn created(task: &Task) -> Self {
        Self::new(task, TaskEventKind::created(task))
    }

    /// Maps to a WAL record. `None` for `retry` and `recovered`.
    pub fn to_log_entry(&self) -> Result<Option<EventLogEntry>> {
        let Some(entry_type) = self.kind.log_type() else {
            return Ok(None);
        };
        Ok(Some(EventLogEntry {
            entry_type,
            task_id: self.task_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
            event_id: self.id.clone(),
            timestamp: self.timestamp,
            payload: self.kind.payload()?,
        }))
    }

    /// Rebuilds an event from a WAL record or a stored repository event.
    pub fn from_log_entry(entry: &EventLogEntry) -> Result<Self> {
        let tag = match entry.entry_type {
            EventLogEntryType::TaskCreated => "created",
            EventLogEntryType::TaskStart => "start",
            EventLogEntryType::TaskProgress => "progress",
            EventLogEntryType::TaskComplete => "complete",
            EventLogEntryType::TaskError => "error",
            EventLogEntryType::TaskCancelled => "cancelled",
            EventLogEntryType::TaskHeartbeat => "heartbeat",
            EventLogEntryType::TaskCustom => "custom",
        };
        let mut payload = match &entry.payload {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(Error::Validation(format!(
                    "event {} payload is not an object: {other}",
                    entry.event_id
                )));
            }
        };
        payload.insert("type".to_string(), Value::String(tag.to_string()));
        let kind: TaskEventKind = serde_json::from_value(Value::Object(payload))?;
        Ok(Self {
            id: entry.event_id.clone(),
            task_id: entry.task_id.clone(),
            idempotency_key: entry.idempotency_key.clone(),
            timestamp: entry.timestamp,
            kind,
        })
    }
}
