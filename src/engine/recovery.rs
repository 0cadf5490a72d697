//! Bringing interrupted tasks back.
//!
//! A background pass looks for `running` background tasks whose heartbeat
//! went quiet and re-runs them, through the definition's `recover` handler
//! when it has one. User tasks are only recovered when their owner
//! reconnects ([`TaskRecovery::handle_database_check`]).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::{ExecutionOutcome, SharedTask, TaskExecutor};
use super::handler::RecoveryContext;
use super::registry::TaskRegistry;
use super::ClearOnDrop;
use crate::error::{Error, Result};
use crate::event::{RecoveryStrategy, TaskEvent, TaskEventKind};
use crate::guard::{Guard, lock};
use crate::model::{IdempotencyKey, Task, TaskId, TaskStatus, TaskType, UserId};
use crate::storage::TaskRepository;
use crate::stream::StreamManager;
use crate::telemetry::TelemetryHooks;
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Period of the background pass. Zero disables it.
    pub interval: Duration,
    /// A running task whose last heartbeat is older than this is stale.
    pub stale_threshold: Duration,
    /// How often a reconnecting client's running task is re-read.
    pub poll_interval: Duration,
    /// How long a reconnect waits for a live task before giving up.
    pub wait_timeout: Duration,
    /// Recovery-slot ceiling.
    pub max_concurrent: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(30),
            max_concurrent: 3,
        }
    }
}

/// Removes a task from the in-flight set when its recovery ends.
struct InFlight {
    set: Arc<Mutex<HashSet<TaskId>>>,
    id: TaskId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.id);
    }
}

/// Result of one [`TaskRecovery::recover_stale_tasks`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale background tasks seen.
    pub found: usize,
    /// Recoveries started in the background by this pass.
    pub started: usize,
    /// Already executing or recovering here, or no recovery slot was free.
    pub skipped: usize,
    /// Could not be started, e.g. no definition is registered.
    pub failed: usize,
}

/// What a reconnecting client gets back.
#[derive(Debug, Clone)]
pub enum ReconnectOutcome {
    NotFound,
    /// Already finished; replay its stored events.
    Replay { task: Task, events: Vec<TaskEvent> },
    /// Was running and finished while we waited.
    Completed { task: Task, events: Vec<TaskEvent> },
    /// Was stale; a recovery run has been started.
    Recovering { task: Task },
    /// Alive, but did not finish within the wait timeout.
    StillRunning { task: Task },
    /// Admitted but not started.
    Pending { task: Task },
}

fn strategy_label(strategy: RecoveryStrategy) -> &'static str {
    match strategy {
        RecoveryStrategy::Smart => "smart",
        RecoveryStrategy::Reexecute => "reexecute",
    }
}

pub struct TaskRecovery {
    config: RecoveryConfig,
    repository: Arc<dyn TaskRepository>,
    registry: Arc<TaskRegistry>,
    guard: Arc<Guard>,
    executor: Arc<TaskExecutor>,
    streams: Arc<StreamManager>,
    hooks: Arc<dyn TelemetryHooks>,
    running: AtomicBool,
    /// Tasks with a recovery in flight.
    recovering: Arc<Mutex<HashSet<TaskId>>>,
    cancel: CancellationToken,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRecovery {
    pub fn new(
        config: RecoveryConfig,
        repository: Arc<dyn TaskRepository>,
        registry: Arc<TaskRegistry>,
        guard: Arc<Guard>,
        executor: Arc<TaskExecutor>,
        streams: Arc<StreamManager>,
        hooks: Arc<dyn TelemetryHooks>,
    ) -> Self {
        Self {
            config,
            repository,
            registry,
            guard,
            executor,
            streams,
            hooks,
            running: AtomicBool::new(false),
            recovering: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancellationToken::new(),
            loop_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Starts the periodic pass, unless the interval is zero.
    pub fn spawn(self: &Arc<Self>) {
        if self.config.interval.is_zero() {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.interval);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match this.recover_stale_tasks().await {
                            Ok(report) if report.found > 0 => info!(
                                found = report.found,
                                started = report.started,
                                skipped = report.skipped,
                                failed = report.failed,
                                "recovery pass finished"
                            ),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "recovery pass failed"),
                        }
                    }
                }
            }
        });
        *lock(&self.loop_task) = Some(handle);
    }

    /// Stops the periodic pass. Recoveries already running finish on their
    /// own (or are aborted through the executor).
    pub fn stop(&self) {
        self.cancel.cancel();
        lock(&self.loop_task).take();
    }

    /// One pass over stale background tasks. Each recovery runs on its own
    /// tokio task holding a recovery slot; the pass returns once they are
    /// started. Returns an empty report if a pass is already in progress.
    pub async fn recover_stale_tasks(self: &Arc<Self>) -> Result<RecoveryReport> {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("recovery pass already in progress");
            return Ok(RecoveryReport::default());
        }
        let _clear = ClearOnDrop(&self.running);

        let stale = self
            .repository
            .find_stale_tasks(self.config.stale_threshold)
            .await?;
        let mut report = RecoveryReport::default();
        for stored in stale {
            if stored.task_type != TaskType::Background {
                continue;
            }
            report.found += 1;
            if self.executor.is_running(&stored.idempotency_key)
                || lock(&self.recovering).contains(&stored.id)
            {
                report.skipped += 1;
                continue;
            }
            if let Err(e) = self.registry.require(&stored.name) {
                warn!(task_id = %stored.id, error = %e, "cannot recover task");
                report.failed += 1;
                continue;
            }
            let Some(slot) = self.guard.recovery_slot() else {
                debug!(task_id = %stored.id, "no recovery slot free");
                report.skipped += 1;
                continue;
            };

            lock(&self.recovering).insert(stored.id.clone());
            let in_flight = InFlight {
                set: Arc::clone(&self.recovering),
                id: stored.id.clone(),
            };
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let _slot = slot;
                let _in_flight = in_flight;
                match this.recover_task(&stored, "stale heartbeat").await {
                    Ok(outcome) => debug!(
                        task_id = %stored.id,
                        status = %outcome.status(),
                        "stale task recovered"
                    ),
                    Err(e) => warn!(task_id = %stored.id, error = %e, "task recovery failed"),
                }
            });
            report.started += 1;
        }
        Ok(report)
    }

    /// Re-runs one stored task and waits for it to finish.
    pub async fn recover_task(&self, stored: &Task, reason: &str) -> Result<ExecutionOutcome> {
        let definition = self.registry.require(&stored.name)?;
        let task = Task::restore(stored)?;
        let previous_events = self.stored_events(&task.id).await?;
        let time_since_last_event = previous_events
            .last()
            .and_then(|event| (Utc::now() - event.timestamp).to_std().ok());
        let previous = previous_events.len();

        let recovery = RecoveryContext {
            previous_events,
            reason: reason.to_string(),
            time_since_last_event,
        };
        let (handler, strategy) = match definition.recovery_handler(recovery) {
            Some(handler) => (handler, RecoveryStrategy::Smart),
            None => (definition.handler.clone(), RecoveryStrategy::Reexecute),
        };

        let key = task.idempotency_key.clone();
        self.streams.create_stream(&key);
        self.executor
            .emit(
                &task,
                TaskEventKind::Recovered {
                    strategy,
                    previous_events: previous,
                    reason: reason.to_string(),
                },
            )
            .await?;
        info!(
            task_id = %task.id,
            task = %task.name,
            strategy = strategy_label(strategy),
            previous_events = previous,
            "recovering task"
        );
        self.hooks.counter(
            metrics::TASKS_RECOVERED,
            1,
            &[KeyValue::new("strategy", strategy_label(strategy))],
        );

        let shared: SharedTask = Arc::new(RwLock::new(task));
        let retry = definition
            .retry
            .unwrap_or(self.executor.config().default_retry);
        let outcome = self.executor.execute_with(&shared, &handler, retry).await;
        self.streams.close(&key);

        if let Ok(ExecutionOutcome::Failed {
            error,
            retryable: true,
            ..
        }) = &outcome
        {
            let snapshot = shared.read().await.clone();
            self.guard
                .dead_letter(snapshot, "retry_exhausted", Some(error.clone()));
        }
        outcome
    }

    /// Reconnection path for a client holding an idempotency key.
    ///
    /// The stored task must belong to `user_id` (both `None` for background
    /// tasks).
    pub async fn handle_database_check(
        self: &Arc<Self>,
        key: &IdempotencyKey,
        user_id: Option<&UserId>,
    ) -> Result<ReconnectOutcome> {
        let Some(stored) = self.repository.find_by_idempotency_key(key).await? else {
            return Ok(ReconnectOutcome::NotFound);
        };
        if stored.user_id.as_ref() != user_id {
            return Err(Error::Forbidden(format!(
                "task {key} belongs to a different user"
            )));
        }

        match stored.status {
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                let events = self.stored_events(&stored.id).await?;
                Ok(ReconnectOutcome::Replay {
                    task: stored,
                    events,
                })
            }
            TaskStatus::Created => Ok(ReconnectOutcome::Pending { task: stored }),
            TaskStatus::Running => {
                if !self.executor.is_running(key) && self.is_stale(&stored) {
                    self.start_recovery(stored)
                } else {
                    self.wait_for_finish(stored).await
                }
            }
        }
    }

    fn is_stale(&self, task: &Task) -> bool {
        let last_seen = task
            .last_heartbeat_at
            .or(task.started_at)
            .unwrap_or(task.created_at);
        match (Utc::now() - last_seen).to_std() {
            Ok(age) => age > self.config.stale_threshold,
            Err(_) => false,
        }
    }

    fn start_recovery(self: &Arc<Self>, stored: Task) -> Result<ReconnectOutcome> {
        let Some(slot) = self.guard.recovery_slot() else {
            debug!(task_id = %stored.id, "no recovery slot free for reconnect");
            return Ok(ReconnectOutcome::StillRunning { task: stored });
        };
        let this = Arc::clone(self);
        let task = stored.clone();
        tokio::spawn(async move {
            let _slot = slot;
            if let Err(e) = this.recover_task(&task, "reconnect").await {
                warn!(task_id = %task.id, error = %e, "reconnect recovery failed");
            }
        });
        Ok(ReconnectOutcome::Recovering { task: stored })
    }

    async fn wait_for_finish(&self, stored: Task) -> Result<ReconnectOutcome> {
        let deadline = Instant::now() + self.config.wait_timeout;
        let mut latest = stored;
        loop {
            if Instant::now() >= deadline {
                return Ok(ReconnectOutcome::StillRunning { task: latest });
            }
            tokio::time::sleep(self.config.poll_interval).await;
            match self.repository.find_by_id(&latest.id).await? {
                Some(task) if task.status.is_finished() => {
                    let events = self.stored_events(&task.id).await?;
                    return Ok(ReconnectOutcome::Completed { task, events });
                }
                Some(task) => latest = task,
                None => return Ok(ReconnectOutcome::NotFound),
            }
        }
    }

    async fn stored_events(&self, task_id: &TaskId) -> Result<Vec<TaskEvent>> {
        let stored = self.repository.get_events(task_id).await?;
        let mut events = Vec::with_capacity(stored.len());
        for event in &stored {
            match event.to_task_event() {
                Ok(event) => events.push(event),
                Err(e) => warn!(event_id = %event.event_id, error = %e, "skipping unreadable stored event"),
            }
        }
        Ok(events)
    }
}
