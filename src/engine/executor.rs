//! Runs one task to a terminal state.
//!
//! The executor owns the per-execution bookkeeping: the abort token keyed by
//! idempotency key, the heartbeat task, the retry loop and the events each
//! step produces. Every event is appended to the WAL before it is pushed to
//! the task's stream; heartbeats go to the WAL only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use super::handler::{HandlerOutput, TaskContext, TaskDefinition, TaskHandler};
use super::retry::RetryConfig;
use crate::error::{Error, Result, TaskError};
use crate::event::{TaskEvent, TaskEventKind};
use crate::guard::lock;
use crate::model::{IdempotencyKey, Task, TaskId, TaskStatus};
use crate::stream::StreamManager;
use crate::telemetry::TelemetryHooks;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};
use crate::wal::EventLog;

/// A task shared between the orchestrator, the executor and task handles.
pub type SharedTask = Arc<RwLock<Task>>;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub heartbeat_interval: Duration,
    /// Used by definitions without their own retry policy.
    pub default_retry: RetryConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            default_retry: RetryConfig::default(),
        }
    }
}

/// How an execution ended. Infrastructure failures are `Err` instead.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed {
        result: Value,
    },
    Failed {
        error: String,
        /// The last error was retryable; attempts ran out.
        retryable: bool,
        attempts: u32,
    },
    Cancelled,
}

impl ExecutionOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            ExecutionOutcome::Completed { .. } => TaskStatus::Completed,
            ExecutionOutcome::Failed { .. } => TaskStatus::Failed,
            ExecutionOutcome::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// Writes events: WAL first, then the stream.
#[derive(Clone)]
struct Emitter {
    event_log: Arc<EventLog>,
    streams: Arc<StreamManager>,
    hooks: Arc<dyn TelemetryHooks>,
}

impl Emitter {
    async fn emit(
        &self,
        task_id: &TaskId,
        key: &IdempotencyKey,
        kind: TaskEventKind,
    ) -> Result<TaskEvent> {
        let event = TaskEvent::for_task(task_id.clone(), key.clone(), kind);
        if let Some(entry) = event.to_log_entry()? {
            self.event_log.append_entry(&entry, None).await?;
            self.hooks.counter(
                metrics::WAL_APPENDS,
                1,
                &[KeyValue::new("type", entry.entry_type.as_str())],
            );
        }
        if !matches!(event.kind, TaskEventKind::Heartbeat) {
            self.streams.push(key, event.clone());
        }
        Ok(event)
    }
}

type Controllers = Arc<Mutex<HashMap<IdempotencyKey, CancellationToken>>>;

/// Removes the abort controller and stops the heartbeat however the
/// execution ends.
struct Registration {
    controllers: Controllers,
    key: IdempotencyKey,
    heartbeat: Option<JoinHandle<()>>,
}

impl Registration {
    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.stop_heartbeat();
        lock(&self.controllers).remove(&self.key);
    }
}

enum Invocation {
    Completed(Value),
    Failed(TaskError),
    Cancelled,
}

enum Finish {
    Completed(Value),
    Failed {
        error: TaskError,
        retryable: bool,
        attempt: u32,
    },
    Cancelled,
}

pub struct TaskExecutor {
    config: ExecutorConfig,
    emitter: Emitter,
    controllers: Controllers,
}

impl TaskExecutor {
    pub fn new(
        config: ExecutorConfig,
        event_log: Arc<EventLog>,
        streams: Arc<StreamManager>,
        hooks: Arc<dyn TelemetryHooks>,
    ) -> Self {
        Self {
            config,
            emitter: Emitter {
                event_log,
                streams,
                hooks,
            },
            controllers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Records an event for `task` outside an execution.
    pub async fn emit(&self, task: &Task, kind: TaskEventKind) -> Result<TaskEvent> {
        self.emitter
            .emit(&task.id, &task.idempotency_key, kind)
            .await
    }

    /// Runs the definition's handler with its retry policy.
    pub async fn execute(
        &self,
        task: &SharedTask,
        definition: &TaskDefinition,
    ) -> Result<ExecutionOutcome> {
        self.execute_linked(task, definition, CancellationToken::new())
            .await
    }

    /// Like [`TaskExecutor::execute`], with the abort signal supplied by the
    /// caller. A token cancelled before the first attempt cancels the task.
    pub async fn execute_linked(
        &self,
        task: &SharedTask,
        definition: &TaskDefinition,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let retry = definition.retry.unwrap_or(self.config.default_retry);
        let snapshot = task.read().await.clone();
        let span = start_task_span(&snapshot);
        self.run(task, &definition.handler, retry, snapshot, span.clone(), cancel)
            .instrument(span)
            .await
    }

    /// Runs an explicit handler. Recovery uses this for `recover` handlers.
    ///
    /// The task must be `created`, or `running` when resuming an
    /// interrupted execution.
    pub async fn execute_with(
        &self,
        task: &SharedTask,
        handler: &TaskHandler,
        retry: RetryConfig,
    ) -> Result<ExecutionOutcome> {
        let snapshot = task.read().await.clone();
        let span = start_task_span(&snapshot);
        self.run(task, handler, retry, snapshot, span.clone(), CancellationToken::new())
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        task: &SharedTask,
        handler: &TaskHandler,
        retry: RetryConfig,
        snapshot: Task,
        span: Span,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let id = snapshot.id;
        let key = snapshot.idempotency_key;
        let name = snapshot.name;
        {
            let mut controllers = lock(&self.controllers);
            if controllers.contains_key(&key) {
                return Err(Error::Validation(format!("task {key} is already executing")));
            }
            controllers.insert(key.clone(), cancel.clone());
        }
        let mut registration = Registration {
            controllers: Arc::clone(&self.controllers),
            key: key.clone(),
            heartbeat: None,
        };

        let previous_attempts = {
            let mut t = task.write().await;
            match t.status {
                TaskStatus::Created => {
                    t.start()?;
                    record_state_transition(&span, TaskStatus::Created, TaskStatus::Running);
                }
                TaskStatus::Running => debug!("resuming running task"),
                other => {
                    return Err(Error::InvalidTransition {
                        from: other,
                        to: TaskStatus::Running,
                    });
                }
            }
            t.attempt
        };
        self.emitter
            .emit(
                &id,
                &key,
                TaskEventKind::Start {
                    attempt: previous_attempts + 1,
                },
            )
            .await?;
        registration.heartbeat = Some(self.spawn_heartbeat(Arc::clone(task), cancel.clone()));

        let started = Instant::now();
        let finish = loop {
            if cancel.is_cancelled() {
                break Finish::Cancelled;
            }
            let (attempt, input, user_id) = {
                let mut t = task.write().await;
                let attempt = t.begin_attempt()?;
                (attempt, t.input.clone(), t.user_id.clone())
            };
            let ctx = TaskContext {
                task_id: id.clone(),
                idempotency_key: key.clone(),
                user_id,
                attempt,
                cancel: cancel.clone(),
            };

            let error = match self.invoke(handler, input, ctx, &id, &key, &cancel).await? {
                Invocation::Completed(value) => break Finish::Completed(value),
                Invocation::Cancelled => break Finish::Cancelled,
                Invocation::Failed(error) => error,
            };
            if cancel.is_cancelled() || matches!(error, TaskError::Cancelled) {
                break Finish::Cancelled;
            }

            let decision = error.classify();
            if !(decision.retryable && retry.has_remaining(attempt)) {
                break Finish::Failed {
                    retryable: decision.retryable,
                    error,
                    attempt,
                };
            }

            let delay = retry.delay_for(attempt);
            let delay_ms = delay.as_millis() as u64;
            warn!(attempt, delay_ms, rule = decision.rule, error = %error, "attempt failed, retrying");
            self.emitter.hooks.counter(
                metrics::TASKS_RETRIES,
                1,
                &[
                    KeyValue::new("task", name.clone()),
                    KeyValue::new("rule", decision.rule),
                ],
            );
            self.emitter
                .emit(
                    &id,
                    &key,
                    TaskEventKind::Retry {
                        attempt,
                        next_attempt: attempt + 1,
                        delay_ms,
                        error: error.to_string(),
                    },
                )
                .await?;
            tokio::select! {
                _ = cancel.cancelled() => break Finish::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        };
        registration.stop_heartbeat();

        let duration_ms = started.elapsed().as_millis() as u64;
        let outcome = match finish {
            Finish::Completed(result) => {
                task.write().await.complete(result.clone())?;
                record_state_transition(&span, TaskStatus::Running, TaskStatus::Completed);
                self.emitter
                    .emit(
                        &id,
                        &key,
                        TaskEventKind::Complete {
                            status: TaskStatus::Completed,
                            result: Some(result.clone()),
                            error: None,
                            duration_ms,
                        },
                    )
                    .await?;
                info!(duration_ms, "task completed");
                ExecutionOutcome::Completed { result }
            }
            Finish::Failed {
                error,
                retryable,
                attempt,
            } => {
                let message = error.to_string();
                task.write().await.fail(message.clone())?;
                record_state_transition(&span, TaskStatus::Running, TaskStatus::Failed);
                self.emitter
                    .emit(
                        &id,
                        &key,
                        TaskEventKind::Error {
                            message: message.clone(),
                            retryable,
                            attempt,
                        },
                    )
                    .await?;
                self.emitter
                    .emit(
                        &id,
                        &key,
                        TaskEventKind::Complete {
                            status: TaskStatus::Failed,
                            result: None,
                            error: Some(message.clone()),
                            duration_ms,
                        },
                    )
                    .await?;
                warn!(attempts = attempt, error = %message, "task failed");
                ExecutionOutcome::Failed {
                    error: message,
                    retryable,
                    attempts: attempt,
                }
            }
            Finish::Cancelled => {
                task.write().await.cancel()?;
                record_state_transition(&span, TaskStatus::Running, TaskStatus::Cancelled);
                self.emitter
                    .emit(
                        &id,
                        &key,
                        TaskEventKind::Cancelled {
                            reason: Some("aborted".to_string()),
                        },
                    )
                    .await?;
                info!("task cancelled");
                ExecutionOutcome::Cancelled
            }
        };

        let status = outcome.status();
        let counter = match status {
            TaskStatus::Completed => metrics::TASKS_COMPLETED,
            TaskStatus::Failed => metrics::TASKS_FAILED,
            _ => metrics::TASKS_CANCELLED,
        };
        let labels = [
            KeyValue::new("task", name),
            KeyValue::new("status", status.as_str()),
        ];
        self.emitter.hooks.counter(counter, 1, &labels);
        self.emitter
            .hooks
            .histogram(metrics::TASK_DURATION_MS, duration_ms as f64, &labels);
        Ok(outcome)
    }

    async fn invoke(
        &self,
        handler: &TaskHandler,
        input: Value,
        ctx: TaskContext,
        id: &TaskId,
        key: &IdempotencyKey,
        cancel: &CancellationToken,
    ) -> Result<Invocation> {
        match handler {
            TaskHandler::Once(f) => {
                let fut = f(input, ctx);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Ok(Invocation::Cancelled),
                    result = fut => Ok(match result {
                        Ok(value) => Invocation::Completed(value),
                        Err(error) => Invocation::Failed(error),
                    }),
                }
            }
            TaskHandler::Streaming(f) => {
                let mut stream = f(input, ctx);
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(Invocation::Cancelled),
                        item = stream.next() => item,
                    };
                    match item {
                        None => return Ok(Invocation::Completed(Value::Null)),
                        Some(Ok(HandlerOutput::Result(value))) => {
                            return Ok(Invocation::Completed(value));
                        }
                        Some(Ok(HandlerOutput::Progress(data))) => {
                            self.emitter
                                .emit(id, key, TaskEventKind::Progress { data })
                                .await?;
                        }
                        Some(Ok(HandlerOutput::Custom { name, data })) => {
                            self.emitter
                                .emit(id, key, TaskEventKind::Custom { name, data })
                                .await?;
                        }
                        Some(Err(error)) => return Ok(Invocation::Failed(error)),
                    }
                }
            }
        }
    }

    fn spawn_heartbeat(&self, task: SharedTask, cancel: CancellationToken) -> JoinHandle<()> {
        let emitter = self.emitter.clone();
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let (id, key) = {
                        let mut t = task.write().await;
                        if t.heartbeat().is_err() {
                            break;
                        }
                        (t.id.clone(), t.idempotency_key.clone())
                    };
                    if let Err(e) = emitter.emit(&id, &key, TaskEventKind::Heartbeat).await {
                        warn!(error = %e, "heartbeat append failed");
                    }
                }
            }
            .in_current_span(),
        )
    }

    /// Signals the execution for `key` to stop. False if nothing runs
    /// under that key.
    pub fn abort(&self, key: &IdempotencyKey) -> bool {
        match lock(&self.controllers).get(key) {
            Some(token) => {
                info!(idempotency_key = %key, "aborting task");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Aborts every execution; returns how many were signalled.
    pub fn abort_all(&self) -> usize {
        let controllers = lock(&self.controllers);
        for token in controllers.values() {
            token.cancel();
        }
        controllers.len()
    }

    pub fn is_running(&self, key: &IdempotencyKey) -> bool {
        lock(&self.controllers).contains_key(key)
    }

    pub fn running_count(&self) -> usize {
        lock(&self.controllers).len()
    }
}
