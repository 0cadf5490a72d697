//! The task system: admission, scheduling and lifecycle over the whole
//! stack.
//!
//! `run` deduplicates by idempotency key, admits through the guard, records
//! `created` in the WAL and queues the task. A scheduler tick pops one
//! pending task per wake, reserves its slot place in pop order, and
//! dispatches it on its own tokio task, which waits for the slot, executes,
//! and routes the outcome (dead letter queue on exhausted retries or slot
//! rejection).

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::sync::{Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ClearOnDrop;
use super::executor::{ExecutionOutcome, ExecutorConfig, SharedTask, TaskExecutor};
use super::handler::TaskDefinition;
use super::recovery::{ReconnectOutcome, RecoveryConfig, TaskRecovery};
use super::registry::TaskRegistry;
use crate::error::{Error, Result};
use crate::event::TaskEventKind;
use crate::flush::{FlushManager, FlushManagerConfig, FlushWorkerStats};
use crate::guard::{DlqEntry, Guard, GuardConfig, GuardStats, SlotReservation, lock};
use crate::model::{IdempotencyKey, Task, TaskId, TaskStatus, UserId};
use crate::storage::TaskRepository;
use crate::stream::{StreamConfig, StreamManager, StreamOptions, StreamStats, StreamTaskEvent};
use crate::telemetry::{NoopHooks, TelemetryHooks, metrics};
use crate::wal::{EventLog, EventLogConfig, EventLogStats};

#[derive(Clone)]
pub struct TaskSystemConfig {
    pub wal: EventLogConfig,
    pub guard: GuardConfig,
    pub streams: StreamConfig,
    pub executor: ExecutorConfig,
    /// `max_concurrent` here sets the guard's recovery-slot ceiling.
    pub recovery: RecoveryConfig,
    /// No flush manager when unset; something else must feed the repository.
    pub flush: Option<FlushManagerConfig>,
    pub scheduler_interval: Duration,
    pub shutdown_grace: Duration,
    pub hooks: Arc<dyn TelemetryHooks>,
}

impl TaskSystemConfig {
    pub fn new(wal: EventLogConfig) -> Self {
        Self {
            wal,
            guard: GuardConfig::default(),
            streams: StreamConfig::default(),
            executor: ExecutorConfig::default(),
            recovery: RecoveryConfig::default(),
            flush: None,
            scheduler_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(30),
            hooks: Arc::new(NoopHooks),
        }
    }
}

/// Arguments to [`TaskSystem::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub user_id: Option<UserId>,
    pub input: Value,
    /// Derived from name, input and user when unset.
    pub idempotency_key: Option<IdempotencyKey>,
}

impl RunOptions {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownOptions {
    /// Skip the grace period and abort running tasks immediately.
    pub force: bool,
    /// Overrides [`TaskSystemConfig::shutdown_grace`].
    pub grace: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct SystemStats {
    /// Admitted, not yet dispatched.
    pub pending: usize,
    /// Dispatched, waiting for a slot.
    pub waiting: usize,
    pub running: usize,
    /// Tasks held in memory, finished ones included until they expire.
    pub tracked: usize,
    pub guard: GuardStats,
    pub streams: StreamStats,
    pub wal: EventLogStats,
    pub flush: Option<FlushWorkerStats>,
}

struct Tracked {
    id: TaskId,
    key: IdempotencyKey,
    task: SharedTask,
    definition: Arc<TaskDefinition>,
    /// Abort signal, handed to the executor once the task starts.
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

impl Tracked {
    fn new(task: Task, definition: Arc<TaskDefinition>) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            id: task.id.clone(),
            key: task.idempotency_key.clone(),
            task: Arc::new(RwLock::new(task)),
            definition,
            cancel: CancellationToken::new(),
            done,
        }
    }
}

#[derive(Default)]
struct Queues {
    pending: VecDeque<IdempotencyKey>,
    waiting: HashSet<IdempotencyKey>,
    running: HashSet<IdempotencyKey>,
    tasks: HashMap<IdempotencyKey, Tracked>,
}

struct Inner {
    registry: Arc<TaskRegistry>,
    repository: Arc<dyn TaskRepository>,
    event_log: Arc<EventLog>,
    guard: Arc<Guard>,
    streams: Arc<StreamManager>,
    executor: Arc<TaskExecutor>,
    recovery: Arc<TaskRecovery>,
    flush: Option<FlushManager>,
    hooks: Arc<dyn TelemetryHooks>,
    state: tokio::sync::Mutex<Queues>,
    wake: Notify,
    ticking: AtomicBool,
    shutting_down: AtomicBool,
    cancel: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    scheduler_interval: Duration,
    shutdown_grace: Duration,
    retention: Duration,
}

#[derive(Clone)]
pub struct TaskSystem {
    inner: Arc<Inner>,
}

impl TaskSystem {
    /// Opens the WAL, starts the guard, flush manager, scheduler and
    /// recovery loop.
    pub async fn init(
        mut config: TaskSystemConfig,
        registry: Arc<TaskRegistry>,
        repository: Arc<dyn TaskRepository>,
    ) -> Result<Self> {
        repository.initialize().await?;

        let event_log = Arc::new(EventLog::open(config.wal).await?);
        event_log.spawn_rotation();

        config.guard.max_recovery_slots = config.recovery.max_concurrent;
        let guard = Arc::new(Guard::new(config.guard));
        guard.start();

        let retention = config.streams.retention;
        let streams = Arc::new(StreamManager::new(config.streams));
        let hooks = config.hooks;
        let executor = Arc::new(TaskExecutor::new(
            config.executor,
            Arc::clone(&event_log),
            Arc::clone(&streams),
            Arc::clone(&hooks),
        ));
        let recovery = Arc::new(TaskRecovery::new(
            config.recovery,
            Arc::clone(&repository),
            Arc::clone(&registry),
            Arc::clone(&guard),
            Arc::clone(&executor),
            Arc::clone(&streams),
            Arc::clone(&hooks),
        ));

        let flush = match config.flush {
            Some(flush_config) => match FlushManager::start(flush_config).await {
                Ok(manager) => Some(manager),
                Err(e) => {
                    let _ = event_log.close().await;
                    guard.shutdown().await;
                    return Err(e);
                }
            },
            None => None,
        };

        let system = Self {
            inner: Arc::new(Inner {
                registry,
                repository,
                event_log,
                guard,
                streams,
                executor,
                recovery,
                flush,
                hooks,
                state: tokio::sync::Mutex::new(Queues::default()),
                wake: Notify::new(),
                ticking: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                scheduler: Mutex::new(None),
                scheduler_interval: config.scheduler_interval,
                shutdown_grace: config.shutdown_grace,
                retention,
            }),
        };
        system.spawn_scheduler();
        system.inner.recovery.spawn();
        info!(
            wal = %system.inner.event_log.config().path.display(),
            flush = system.inner.flush.is_some(),
            "task system started"
        );
        Ok(system)
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    pub fn repository(&self) -> &Arc<dyn TaskRepository> {
        &self.inner.repository
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.inner.event_log
    }

    pub fn guard(&self) -> &Arc<Guard> {
        &self.inner.guard
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.inner.streams
    }

    pub fn recovery(&self) -> &Arc<TaskRecovery> {
        &self.inner.recovery
    }

    /// Whether the task for `key` is executing on this node right now.
    pub fn is_executing(&self, key: &IdempotencyKey) -> bool {
        self.inner.executor.is_running(key)
    }

    /// Registers a definition and returns a template bound to this system.
    pub fn register_task(&self, definition: TaskDefinition) -> Result<TaskTemplate> {
        let definition = self.inner.registry.register(definition)?;
        Ok(TaskTemplate {
            system: self.clone(),
            name: definition.name.clone(),
        })
    }

    /// Template for an already registered definition.
    pub fn template(&self, name: &str) -> Result<TaskTemplate> {
        self.inner.registry.require(name)?;
        Ok(TaskTemplate {
            system: self.clone(),
            name: name.to_string(),
        })
    }

    /// Submits a task. Resubmitting a key that is in flight or completed
    /// returns the existing task instead of running it again.
    pub async fn run(&self, name: &str, options: RunOptions) -> Result<TaskHandle> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let definition = inner.registry.require(name)?;
        definition.validate_input(&options.input)?;
        let task = Task::new(
            name,
            options.input,
            options.user_id,
            options.idempotency_key,
        )?;
        let key = task.idempotency_key.clone();
        let submitted = |result: &'static str| {
            inner.hooks.counter(
                metrics::TASKS_SUBMITTED,
                1,
                &[
                    KeyValue::new("task", name.to_string()),
                    KeyValue::new("result", result),
                ],
            );
        };

        // Held until the task is queued so concurrent submissions of one key
        // cannot both get past the duplicate checks.
        let mut state = inner.state.lock().await;
        if let Some(existing) = state.tasks.get(&key) {
            let status = existing.task.read().await.status;
            if !matches!(status, TaskStatus::Failed | TaskStatus::Cancelled) {
                debug!(idempotency_key = %key, %status, "attaching to existing task");
                submitted("duplicate");
                return Ok(self.tracked_handle(existing));
            }
        }
        // A dead-lettered key is turned away by admission below, whatever the
        // repository holds for it.
        let dead_lettered = inner.guard.dlq().contains(&key);
        match inner.repository.find_by_idempotency_key(&key).await {
            Ok(Some(stored))
                if !dead_lettered
                    && !matches!(stored.status, TaskStatus::Failed | TaskStatus::Cancelled) =>
            {
                debug!(idempotency_key = %key, status = %stored.status, "attaching to stored task");
                submitted("duplicate");
                return Ok(self.stored_handle(stored));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "repository lookup failed, deduplicating in memory only"),
        }

        if let Err(e) = inner.guard.admit(&task) {
            submitted("rejected");
            return Err(e);
        }
        inner.streams.create_stream(&key);
        if let Err(e) = inner
            .executor
            .emit(&task, TaskEventKind::created(&task))
            .await
        {
            inner.guard.discard(&task);
            return Err(e);
        }

        let tracked = Tracked::new(task, definition);
        let handle = self.tracked_handle(&tracked);
        info!(
            task_id = %tracked.id,
            task = name,
            idempotency_key = %key,
            "task submitted"
        );
        state.tasks.insert(key.clone(), tracked);
        state.pending.push_back(key);
        inner
            .hooks
            .gauge(metrics::QUEUE_PENDING, state.pending.len() as f64, &[]);
        drop(state);

        submitted("created");
        inner.wake.notify_one();
        Ok(handle)
    }

    fn tracked_handle(&self, tracked: &Tracked) -> TaskHandle {
        TaskHandle {
            id: tracked.id.clone(),
            key: tracked.key.clone(),
            task: Arc::clone(&tracked.task),
            done: Some(tracked.done.subscribe()),
            system: Arc::clone(&self.inner),
        }
    }

    fn stored_handle(&self, stored: Task) -> TaskHandle {
        TaskHandle {
            id: stored.id.clone(),
            key: stored.idempotency_key.clone(),
            task: Arc::new(RwLock::new(stored)),
            done: None,
            system: Arc::clone(&self.inner),
        }
    }

    fn spawn_scheduler(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = inner.wake.notified() => {}
                    _ = tokio::time::sleep(inner.scheduler_interval) => {}
                }
                Inner::tick(&inner).await;
            }
            debug!("scheduler stopped");
        });
        *lock(&self.inner.scheduler) = Some(handle);
    }

    /// Stops the execution for `key`, or cancels it if it has not started.
    /// Returns false if it already finished.
    pub async fn abort(&self, key: &IdempotencyKey) -> Result<bool> {
        self.inner.abort(key).await
    }

    /// Moves a dead-lettered task back into the pending queue.
    pub async fn retry_dead_letter(&self, key: &IdempotencyKey) -> Result<TaskHandle> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let mut state = inner.state.lock().await;
        if let Some(existing) = state.tasks.get(key) {
            let status = existing.task.read().await.status;
            if !status.is_finished() && !*existing.done.borrow() {
                return Err(Error::Validation(format!("task {key} is still in flight")));
            }
        }
        let task = inner.guard.dlq().retry(key)?;
        let definition = inner.registry.require(&task.name)?;
        inner.guard.readmit(&task);
        inner.streams.create_stream(key);

        let tracked = Tracked::new(task, definition);
        let handle = self.tracked_handle(&tracked);
        info!(task_id = %tracked.id, idempotency_key = %key, "dead letter requeued");
        state.tasks.insert(key.clone(), tracked);
        state.pending.push_back(key.clone());
        drop(state);

        inner.wake.notify_one();
        Ok(handle)
    }

    pub fn dead_letters(&self) -> Vec<DlqEntry> {
        self.inner.guard.dlq().entries()
    }

    pub async fn get_stats(&self) -> SystemStats {
        let inner = &self.inner;
        let (pending, waiting, running, tracked) = {
            let state = inner.state.lock().await;
            (
                state.pending.len(),
                state.waiting.len(),
                state.running.len(),
                state.tasks.len(),
            )
        };
        let flush = match &inner.flush {
            Some(manager) => match manager.stats().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(error = %e, "flush stats unavailable");
                    None
                }
            },
            None => None,
        };
        let guard = inner.guard.stats();
        inner
            .hooks
            .gauge(metrics::SLOTS_ACTIVE, guard.slots.active as f64, &[]);
        SystemStats {
            pending,
            waiting,
            running,
            tracked,
            guard,
            streams: inner.streams.stats(),
            wal: inner.event_log.stats().await,
            flush,
        }
    }

    /// Stops the system. Tasks still pending stay `created` in the WAL and
    /// are picked up by recovery or resubmission later.
    pub async fn shutdown(&self, options: ShutdownOptions) -> Result<()> {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(force = options.force, "task system shutting down");

        inner.cancel.cancel();
        let scheduler = lock(&inner.scheduler).take();
        if let Some(handle) = scheduler {
            let _ = handle.await;
        }
        inner.recovery.stop();

        if !options.force {
            let grace = options.grace.unwrap_or(inner.shutdown_grace);
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline && inner.in_flight().await > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        inner.guard.slots().reject_waiters();
        let aborted = inner.executor.abort_all();
        if aborted > 0 {
            warn!(aborted, "aborting running tasks");
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && inner.in_flight().await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let pending: Vec<(IdempotencyKey, SharedTask)> = {
            let mut state = inner.state.lock().await;
            let keys: Vec<IdempotencyKey> = state.pending.drain(..).collect();
            keys.into_iter()
                .filter_map(|key| {
                    let task = state.tasks.get(&key).map(|t| Arc::clone(&t.task))?;
                    Some((key, task))
                })
                .collect()
        };
        if !pending.is_empty() {
            info!(count = pending.len(), "discarding pending tasks");
        }
        for (key, task) in pending {
            inner.guard.discard(&*task.read().await);
            inner.finish(&key).await;
        }

        inner.streams.close_all();

        let mut first_error = None;
        if let Some(flush) = &inner.flush {
            if let Err(e) = flush.shutdown().await {
                warn!(error = %e, "flush manager shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = inner.event_log.close().await {
            error!(error = %e, "event log close failed");
            first_error.get_or_insert(e);
        }
        inner.guard.shutdown().await;
        inner.streams.shutdown();
        if let Err(e) = inner.repository.close().await {
            warn!(error = %e, "repository close failed");
            first_error.get_or_insert(e);
        }

        info!("task system stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Inner {
    async fn in_flight(&self) -> usize {
        let state = self.state.lock().await;
        state.waiting.len() + state.running.len()
    }

    /// Dispatches at most one pending task.
    async fn tick(self: &Arc<Self>) {
        if self.ticking.swap(true, Ordering::AcqRel) {
            return;
        }
        let _clear = ClearOnDrop(&self.ticking);

        let mut state = self.state.lock().await;
        let Some(key) = state.pending.pop_front() else {
            return;
        };
        let Some(tracked) = state.tasks.get(&key) else {
            return;
        };
        let task = Arc::clone(&tracked.task);
        let definition = Arc::clone(&tracked.definition);
        let cancel = tracked.cancel.clone();
        // Reserved here, in pop order, so tasks reach their slots first in,
        // first out however the dispatch tasks get scheduled.
        let reservation = self.guard.reserve_slot(&*task.read().await);
        state.waiting.insert(key.clone());
        let more = !state.pending.is_empty();
        self.hooks
            .gauge(metrics::QUEUE_PENDING, state.pending.len() as f64, &[]);
        drop(state);

        tokio::spawn(Arc::clone(self).dispatch(key, task, definition, cancel, reservation));
        if more {
            self.wake.notify_one();
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        key: IdempotencyKey,
        task: SharedTask,
        definition: Arc<TaskDefinition>,
        cancel: CancellationToken,
        reservation: Result<SlotReservation>,
    ) {
        let acquired = match reservation {
            Ok(reservation) => tokio::select! {
                _ = cancel.cancelled() => None,
                result = reservation.acquire() => Some(result),
            },
            Err(e) => Some(Err(e)),
        };
        let snapshot = task.read().await.clone();
        let has_slot = matches!(acquired, Some(Ok(())));

        // `abort` cancels under the same lock, so a task marked running here
        // is reachable through its token.
        let start = {
            let mut state = self.state.lock().await;
            state.waiting.remove(&key);
            let start = has_slot && !cancel.is_cancelled();
            if start {
                state.running.insert(key.clone());
            }
            start
        };

        if !start {
            if has_slot {
                self.guard.release_slot(&snapshot);
            }
            if cancel.is_cancelled() {
                if let Err(e) = self.cancel_unstarted(&task).await {
                    error!(idempotency_key = %key, error = %e, "failed to record cancellation");
                }
                self.finish(&key).await;
            } else if let Some(Err(e)) = acquired {
                if self.shutting_down.load(Ordering::Acquire) {
                    self.finish(&key).await;
                } else {
                    self.reject_to_dlq(&snapshot, &e).await;
                    self.forget(&key).await;
                }
            }
            return;
        }

        self.hooks.gauge(
            metrics::SLOTS_ACTIVE,
            self.guard.slots().active() as f64,
            &[],
        );
        let outcome = self
            .executor
            .execute_linked(&task, &definition, cancel)
            .await;
        self.guard.release_slot(&snapshot);
        self.state.lock().await.running.remove(&key);

        match outcome {
            Ok(ExecutionOutcome::Completed { .. }) => self.guard.dlq().clear_history(&key),
            Ok(ExecutionOutcome::Failed {
                error,
                retryable: true,
                attempts,
            }) => {
                warn!(idempotency_key = %key, attempts, "retries exhausted, dead-lettering");
                let failed = task.read().await.clone();
                self.guard.dead_letter(failed, "retry_exhausted", Some(error));
                self.hooks.counter(
                    metrics::TASKS_DEAD_LETTERED,
                    1,
                    &[KeyValue::new("reason", "retry_exhausted")],
                );
            }
            Ok(_) => {}
            Err(e) => {
                error!(idempotency_key = %key, error = %e, "execution aborted by infrastructure failure");
                let mut t = task.write().await;
                if t.status == TaskStatus::Running {
                    let _ = t.fail(e.to_string());
                }
            }
        }
        self.finish(&key).await;
    }

    /// Moves a task that never started to `cancelled`. False if it had
    /// already left `created`.
    async fn cancel_unstarted(&self, task: &SharedTask) -> Result<bool> {
        let snapshot = {
            let mut t = task.write().await;
            if t.cancel().is_err() {
                return Ok(false);
            }
            t.clone()
        };
        info!(idempotency_key = %snapshot.idempotency_key, "task cancelled before start");
        self.executor
            .emit(
                &snapshot,
                TaskEventKind::Cancelled {
                    reason: Some("aborted before start".to_string()),
                },
            )
            .await?;
        Ok(true)
    }

    async fn reject_to_dlq(&self, task: &Task, cause: &Error) {
        warn!(idempotency_key = %task.idempotency_key, error = %cause, "no execution slot, dead-lettering");
        let kind = TaskEventKind::Error {
            message: cause.to_string(),
            retryable: cause.is_retryable(),
            attempt: task.attempt,
        };
        if let Err(e) = self.executor.emit(task, kind).await {
            error!(error = %e, "failed to record slot rejection");
        }
        self.guard
            .dead_letter(task.clone(), "slot_rejected", Some(cause.to_string()));
        self.hooks.counter(
            metrics::TASKS_DEAD_LETTERED,
            1,
            &[KeyValue::new("reason", "slot_rejected")],
        );
    }

    /// Closes the stream, wakes waiters and forgets the task once the
    /// stream retention has passed.
    async fn finish(self: &Arc<Self>, key: &IdempotencyKey) {
        self.streams.close(key);
        let id = {
            let state = self.state.lock().await;
            match state.tasks.get(key) {
                Some(tracked) => {
                    tracked.done.send_replace(true);
                    tracked.id.clone()
                }
                None => return,
            }
        };

        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let retention = self.retention;
        let key = key.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(retention) => {}
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().await;
            let expired = state
                .tasks
                .get(&key)
                .is_some_and(|t| t.id == id && *t.done.borrow());
            if expired {
                state.tasks.remove(&key);
            }
        });
    }

    /// Wakes waiters and drops the task right away, so its key can be
    /// submitted again.
    async fn forget(&self, key: &IdempotencyKey) {
        self.streams.close(key);
        let mut state = self.state.lock().await;
        if let Some(tracked) = state.tasks.remove(key) {
            tracked.done.send_replace(true);
        }
    }

    async fn abort(self: &Arc<Self>, key: &IdempotencyKey) -> Result<bool> {
        let task = {
            let mut state = self.state.lock().await;
            let Some(tracked) = state.tasks.get(key) else {
                // Recovery runs executions this system does not track.
                if self.executor.abort(key) {
                    return Ok(true);
                }
                return Err(Error::NotFound(format!("no task with key {key}")));
            };
            let task = Arc::clone(&tracked.task);
            let cancel = tracked.cancel.clone();
            if state.running.contains(key) || state.waiting.contains(key) {
                // Dispatch checks the token under this lock before starting.
                cancel.cancel();
                return Ok(true);
            }
            let Some(index) = state.pending.iter().position(|k| k == key) else {
                return Ok(self.executor.abort(key));
            };
            state.pending.remove(index);
            cancel.cancel();
            task
        };

        let cancelled = self.cancel_unstarted(&task).await;
        self.guard.discard(&*task.read().await);
        self.finish(key).await;
        cancelled
    }
}

/// A registered definition bound to its system.
#[derive(Clone)]
pub struct TaskTemplate {
    system: TaskSystem,
    name: String,
}

impl TaskTemplate {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn run(&self, options: RunOptions) -> Result<TaskHandle> {
        self.system.run(&self.name, options).await
    }

    /// Reconnects to a task by key. See
    /// [`TaskRecovery::handle_database_check`].
    pub async fn recover(
        &self,
        key: &IdempotencyKey,
        user_id: Option<&UserId>,
    ) -> Result<ReconnectOutcome> {
        self.system
            .inner
            .recovery
            .handle_database_check(key, user_id)
            .await
    }
}

/// A submitted task.
pub struct TaskHandle {
    id: TaskId,
    key: IdempotencyKey,
    task: SharedTask,
    /// `None` for tasks only known from the repository.
    done: Option<watch::Receiver<bool>>,
    system: Arc<Inner>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("tracked", &self.done.is_some())
            .finish_non_exhaustive()
    }
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Current state. Repository-backed handles re-read the repository.
    pub async fn snapshot(&self) -> Task {
        if self.done.is_none() {
            if let Ok(Some(stored)) = self.system.repository.find_by_id(&self.id).await {
                *self.task.write().await = stored;
            }
        }
        self.task.read().await.clone()
    }

    /// Live events, or a replay of stored events once the in-memory stream
    /// is gone.
    pub fn stream(&self, options: StreamOptions) -> BoxStream<'static, Result<StreamTaskEvent>> {
        if self.system.streams.has_stream(&self.key) {
            return self.system.streams.create_generator(&self.key, options);
        }
        let repository = Arc::clone(&self.system.repository);
        let id = self.id.clone();
        let last_seq = options.last_seq;
        stream::once(async move { repository.get_events(&id).await })
            .flat_map(move |result| match result {
                Ok(stored) => {
                    let events: Vec<Result<StreamTaskEvent>> = stored
                        .iter()
                        .enumerate()
                        .map(|(i, event)| {
                            event.to_task_event().map(|event| StreamTaskEvent {
                                seq: i as u64 + 1,
                                event,
                            })
                        })
                        .filter(|item| !matches!(item, Ok(e) if e.seq <= last_seq))
                        .collect();
                    stream::iter(events).boxed()
                }
                Err(e) => stream::iter(vec![Err(e)]).boxed(),
            })
            .boxed()
    }

    /// Waits until the task finishes and returns its final state.
    pub async fn wait(&self) -> Result<Task> {
        match &self.done {
            Some(done) => {
                let mut done = done.clone();
                // A dropped sender means the system is gone; report what we have.
                let _ = done.wait_for(|finished| *finished).await;
                Ok(self.task.read().await.clone())
            }
            None => {
                let poll = self.system.recovery.config().poll_interval;
                loop {
                    match self.system.repository.find_by_id(&self.id).await? {
                        Some(task) if task.status.is_finished() => return Ok(task),
                        Some(_) => tokio::time::sleep(poll).await,
                        None => {
                            return Err(Error::NotFound(format!("task {}", self.id)));
                        }
                    }
                }
            }
        }
    }
}
