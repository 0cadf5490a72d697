//! SQLite repository over an `sqlx` pool.
//!
//! Timestamps are stored as RFC 3339 text with millisecond precision and a
//! `Z` suffix, so string comparison orders them. JSON columns are text.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{IdempotencyKey, Task, TaskId, UserId};
use crate::wal::{EventLogEntryType, EventLogEvent};

use super::{StoredEvent, TaskRepository, apply_entry, is_stored_event, task_from_created};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id                  TEXT PRIMARY KEY,
    name                TEXT NOT NULL,
    input               TEXT NOT NULL,
    user_id             TEXT,
    idempotency_key     TEXT NOT NULL,
    task_type           TEXT NOT NULL,
    status              TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    started_at          TEXT,
    completed_at        TEXT,
    last_heartbeat_at   TEXT,
    attempt             INTEGER NOT NULL DEFAULT 0,
    result              TEXT,
    error               TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_key ON tasks(idempotency_key, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, last_heartbeat_at);

CREATE TABLE IF NOT EXISTS task_events (
    event_id        TEXT PRIMARY KEY,
    task_id         TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    seq             INTEGER NOT NULL,
    entry_type      TEXT NOT NULL,
    timestamp       TEXT NOT NULL,
    payload         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_events_task ON task_events(task_id, seq);
";

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::persistence("decode", format!("{column}: {e}"), false))
}

fn parse_opt_ts(column: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(column, &v)).transpose()
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: String,
    name: String,
    input: String,
    user_id: Option<String>,
    idempotency_key: String,
    task_type: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    last_heartbeat_at: Option<String>,
    attempt: i64,
    result: Option<String>,
    error: Option<String>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId::new(self.id)?,
            name: self.name,
            input: serde_json::from_str(&self.input)?,
            user_id: self.user_id.map(UserId::new).transpose()?,
            idempotency_key: IdempotencyKey::new(self.idempotency_key)?,
            task_type: self.task_type.parse()?,
            status: self.status.parse()?,
            created_at: parse_ts("created_at", &self.created_at)?,
            started_at: parse_opt_ts("started_at", self.started_at)?,
            completed_at: parse_opt_ts("completed_at", self.completed_at)?,
            last_heartbeat_at: parse_opt_ts("last_heartbeat_at", self.last_heartbeat_at)?,
            attempt: u32::try_from(self.attempt).unwrap_or(0),
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    event_id: String,
    task_id: String,
    idempotency_key: String,
    seq: i64,
    entry_type: String,
    timestamp: String,
    payload: String,
}

impl EventRow {
    fn try_into_event(self) -> Result<StoredEvent> {
        Ok(StoredEvent {
            event_id: self.event_id,
            task_id: TaskId::new(self.task_id)?,
            idempotency_key: IdempotencyKey::new(self.idempotency_key)?,
            seq: u64::try_from(self.seq).unwrap_or(0),
            entry_type: self.entry_type.parse()?,
            timestamp: parse_ts("timestamp", &self.timestamp)?,
            payload: serde_json::from_str(&self.payload)?,
        })
    }
}

const SELECT_TASK: &str = "SELECT id, name, input, user_id, idempotency_key, task_type, status, \
     created_at, started_at, completed_at, last_heartbeat_at, attempt, result, error FROM tasks";

/// Repository backed by a single SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    /// Opens a pool. The file is created if missing and put in WAL journal
    /// mode. `sqlite::memory:` gets a single long-lived connection.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load(tx: &mut Transaction<'_, Sqlite>, id: &TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!("{SELECT_TASK} WHERE id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&mut **tx)
            .await?;
        row.map(TaskRow::try_into_task).transpose()
    }

    async fn insert_task(tx: &mut Transaction<'_, Sqlite>, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO tasks (id, name, input, user_id, idempotency_key, task_type, status, \
             created_at, started_at, completed_at, last_heartbeat_at, attempt, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(task.id.as_str())
        .bind(&task.name)
        .bind(task.input.to_string())
        .bind(task.user_id.as_ref().map(UserId::as_str))
        .bind(task.idempotency_key.as_str())
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(ts(task.created_at))
        .bind(task.started_at.map(ts))
        .bind(task.completed_at.map(ts))
        .bind(task.last_heartbeat_at.map(ts))
        .bind(i64::from(task.attempt))
        .bind(task.result.as_ref().map(|r| r.to_string()))
        .bind(task.error.as_deref())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn update_task(tx: &mut Transaction<'_, Sqlite>, task: &Task) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET status = ?1, started_at = ?2, completed_at = ?3, \
             last_heartbeat_at = ?4, attempt = ?5, result = ?6, error = ?7 WHERE id = ?8",
        )
        .bind(task.status.as_str())
        .bind(task.started_at.map(ts))
        .bind(task.completed_at.map(ts))
        .bind(task.last_heartbeat_at.map(ts))
        .bind(i64::from(task.attempt))
        .bind(task.result.as_ref().map(|r| r.to_string()))
        .bind(task.error.as_deref())
        .bind(task.id.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_event(tx: &mut Transaction<'_, Sqlite>, event: &EventLogEvent) -> Result<()> {
        let entry = &event.entry;
        sqlx::query(
            "INSERT OR IGNORE INTO task_events (event_id, task_id, idempotency_key, seq, entry_type, timestamp, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&entry.event_id)
        .bind(entry.task_id.as_str())
        .bind(entry.idempotency_key.as_str())
        .bind(i64::try_from(event.seq).unwrap_or(i64::MAX))
        .bind(entry.entry_type.as_str())
        .bind(ts(entry.timestamp))
        .bind(entry.payload.to_string())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn initialize(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("sqlite task repository initialized");
        Ok(())
    }

    async fn execute_batch(&self, entries: &[EventLogEvent]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for event in entries {
            let entry = &event.entry;
            if entry.entry_type == EventLogEntryType::TaskCreated {
                Self::insert_task(&mut tx, &task_from_created(entry)?).await?;
            } else if let Some(mut task) = Self::load(&mut tx, &entry.task_id).await? {
                apply_entry(&mut task, entry);
                Self::update_task(&mut tx, &task).await?;
            } else {
                warn!(task_id = %entry.task_id, seq = event.seq, "entry for unknown task");
            }
            if is_stored_event(entry.entry_type) {
                Self::insert_event(&mut tx, event).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!("{SELECT_TASK} WHERE id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::try_into_task).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &IdempotencyKey) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "{SELECT_TASK} WHERE idempotency_key = ?1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRow::try_into_task).transpose()
    }

    async fn find_stale_tasks(&self, threshold: Duration) -> Result<Vec<Task>> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| Error::Validation(format!("stale threshold: {e}")))?;
        let cutoff = ts(Utc::now() - threshold);
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "{SELECT_TASK} WHERE status = 'running' \
             AND COALESCE(last_heartbeat_at, started_at, created_at) < ?1 \
             ORDER BY created_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    async fn get_events(&self, task_id: &TaskId) -> Result<Vec<StoredEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT event_id, task_id, idempotency_key, seq, entry_type, timestamp, payload
             FROM task_events WHERE task_id = ?1 ORDER BY seq",
        )
        .bind(task_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
