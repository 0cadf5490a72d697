//! In-memory repository for embedded use and tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{IdempotencyKey, Task, TaskId, TaskStatus};
use crate::wal::{EventLogEntryType, EventLogEvent};

use super::{StoredEvent, TaskRepository, apply_entry, is_stored_event, task_from_created};

#[derive(Debug, Clone, Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    events: HashMap<TaskId, Vec<StoredEvent>>,
    event_ids: HashSet<String>,
}

impl State {
    fn apply(&mut self, event: &EventLogEvent) -> Result<()> {
        let entry = &event.entry;
        if entry.entry_type == EventLogEntryType::TaskCreated {
            if !self.tasks.contains_key(&entry.task_id) {
                self.tasks
                    .insert(entry.task_id.clone(), task_from_created(entry)?);
            }
        } else if let Some(task) = self.tasks.get_mut(&entry.task_id) {
            apply_entry(task, entry);
        } else {
            warn!(task_id = %entry.task_id, seq = event.seq, "entry for unknown task");
        }

        if is_stored_event(entry.entry_type) && self.event_ids.insert(entry.event_id.clone()) {
            let events = self.events.entry(entry.task_id.clone()).or_default();
            events.push(StoredEvent::from_log_event(event));
            events.sort_by_key(|e| e.seq);
        }
        Ok(())
    }
}

/// Stores everything in process memory.
///
/// Failure injection: [`fail_next_batches`](Self::fail_next_batches) makes
/// the next `n` batches fail with a retryable persistence error.
#[derive(Debug, Default)]
pub struct InMemoryTaskRepository {
    state: RwLock<State>,
    fail_batches: AtomicU32,
    batches: AtomicU64,
    closed: AtomicBool,
}

impl InMemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_batches(&self, n: u32) {
        self.fail_batches.store(n, Ordering::SeqCst);
    }

    /// Batches applied successfully.
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    /// Inserts a snapshot directly, bypassing the WAL.
    pub async fn insert_task(&self, task: Task) {
        self.state.write().await.tasks.insert(task.id.clone(), task);
    }

    pub async fn task_count(&self) -> usize {
        self.state.read().await.tasks.len()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::persistence("query", "repository is closed", false));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn initialize(&self) -> Result<()> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn execute_batch(&self, entries: &[EventLogEvent]) -> Result<()> {
        self.check_open()?;
        let injected = self
            .fail_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::persistence("execute_batch", "injected failure", true));
        }

        let mut state = self.state.write().await;
        let mut staged = state.clone();
        for event in entries {
            staged.apply(event)?;
        }
        *state = staged;
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find_by_id(&self, id: &TaskId) -> Result<Option<Task>> {
        self.check_open()?;
        Ok(self.state.read().await.tasks.get(id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &IdempotencyKey) -> Result<Option<Task>> {
        self.check_open()?;
        Ok(self
            .state
            .read()
            .await
            .tasks
            .values()
            .filter(|t| &t.idempotency_key == key)
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn find_stale_tasks(&self, threshold: Duration) -> Result<Vec<Task>> {
        self.check_open()?;
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| Error::Validation(format!("stale threshold: {e}")))?;
        let cutoff = Utc::now() - threshold;
        let mut stale: Vec<Task> = self
            .state
            .read()
            .await
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .filter(|t| {
                t.last_heartbeat_at
                    .or(t.started_at)
                    .unwrap_or(t.created_at)
                    < cutoff
            })
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.created_at);
        Ok(stale)
    }

    async fn get_events(&self, task_id: &TaskId) -> Result<Vec<StoredEvent>> {
        self.check_open()?;
        Ok(self
            .state
            .read()
            .await
            .events
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn health_check(&self) -> Result<()> {
        self.check_open()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
