//! Core data model.
//!
//! A task is a named, idempotent unit of work. It has identity (id +
//! idempotency key), ownership (user or background), an opaque input, and a
//! strict lifecycle state machine.

pub mod ids;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub use ids::{IdempotencyKey, TaskId, UserId};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Admitted, waiting for an execution slot.
    Created,
    /// Handler is executing (possibly between retry attempts).
    Running,
    /// Done successfully. Terminal.
    Completed,
    /// Failed; may be reset to `Created` for a dead-letter retry.
    Failed,
    /// Aborted. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Created, Running)
                | (Created, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, Created) // reset for retry
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Terminal for the purposes of one execution: nothing more will happen
    /// unless someone explicitly retries it.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(TaskStatus::Created),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(Error::Other(format!("unknown task status: {s}"))),
        }
    }
}

/// Who a task runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Submitted on behalf of a user; recovered when the user reconnects.
    User,
    /// No owner; recovered proactively by the background sweep.
    Background,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::User => "user",
            TaskType::Background => "background",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(TaskType::User),
            "background" => Ok(TaskType::Background),
            _ => Err(Error::Other(format!("unknown task type: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked by the engine.
///
/// Mutators check the current status and return
/// [`Error::InvalidTransition`] instead of silently fixing things up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,

    /// Template name; selects the registered definition.
    pub name: String,

    /// Opaque payload handed to the handler.
    pub input: Value,

    pub user_id: Option<UserId>,

    pub idempotency_key: IdempotencyKey,

    pub task_type: TaskType,

    pub created_at: DateTime<Utc>,

    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    /// Handler invocations so far.
    pub attempt: u32,

    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Task {
    /// A fresh task in `Created`. The key is derived unless one is supplied.
    pub fn new(
        name: impl Into<String>,
        input: Value,
        user_id: Option<UserId>,
        idempotency_key: Option<IdempotencyKey>,
    ) -> Result<Self> {
        let name = name.into();
        validate_task_name(&name)?;
        let idempotency_key = idempotency_key
            .unwrap_or_else(|| IdempotencyKey::derive(&name, &input, user_id.as_ref()));
        let task_type = if user_id.is_some() {
            TaskType::User
        } else {
            TaskType::Background
        };

        Ok(Self {
            id: TaskId::generate(),
            name,
            input,
            user_id,
            idempotency_key,
            task_type,
            created_at: Utc::now(),
            status: TaskStatus::Created,
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
            attempt: 0,
            result: None,
            error: None,
        })
    }

    /// Rebuilds an in-flight task from a repository snapshot.
    ///
    /// Only `created` and `running` snapshots can be resumed; a running
    /// snapshot stays running so the executor continues its attempt count.
    pub fn restore(stored: &Task) -> Result<Self> {
        match stored.status {
            TaskStatus::Created | TaskStatus::Running => {}
            other => {
                return Err(Error::InvalidTransition {
                    from: other,
                    to: TaskStatus::Running,
                });
            }
        }
        let mut task = stored.clone();
        task.result = None;
        task.error = None;
        task.completed_at = None;
        Ok(task)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, allowed: &[TaskStatus], to: TaskStatus) -> Result<()> {
        if !allowed.contains(&self.status) || !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// `created → running`.
    pub fn start(&mut self) -> Result<()> {
        self.transition(&[TaskStatus::Created], TaskStatus::Running)?;
        let now = Utc::now();
        self.started_at.get_or_insert(now);
        self.last_heartbeat_at = Some(now);
        Ok(())
    }

    /// Counts one more handler invocation. Only valid while running.
    pub fn begin_attempt(&mut self) -> Result<u32> {
        if self.status != TaskStatus::Running {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: TaskStatus::Running,
            });
        }
        self.attempt += 1;
        Ok(self.attempt)
    }

    /// `running → completed`.
    pub fn complete(&mut self, result: Value) -> Result<()> {
        self.transition(&[TaskStatus::Running], TaskStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `running → failed`.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(&[TaskStatus::Running], TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `created | running → cancelled`.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(
            &[TaskStatus::Created, TaskStatus::Running],
            TaskStatus::Cancelled,
        )?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// `failed → created`, clearing the previous run's outcome.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        self.transition(&[TaskStatus::Failed], TaskStatus::Created)?;
        self.started_at = None;
        self.completed_at = None;
        self.last_heartbeat_at = None;
        self.result = None;
        self.error = None;
        self.attempt = 0;
        Ok(())
    }

    /// Records liveness. Only valid while running.
    pub fn heartbeat(&mut self) -> Result<DateTime<Utc>> {
        if self.status != TaskStatus::Running {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: TaskStatus::Running,
            });
        }
        let now = Utc::now();
        self.last_heartbeat_at = Some(now);
        Ok(now)
    }
}

/// Template names: 1-128 chars of `[A-Za-z0-9_.:-]`.
pub fn validate_task_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::Validation(format!(
            "task name must be 1-128 characters, got {}",
            name.len()
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')))
    {
        return Err(Error::Validation(format!(
            "task name {name:?} contains invalid character {c:?}"
        )));
    }
    Ok(())
}
