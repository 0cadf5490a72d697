//! Task definitions and the handlers they run.
//!
//! A handler is either a single future ([`TaskHandler::Once`]) or a stream of
//! [`HandlerOutput`] items ([`TaskHandler::Streaming`]) whose progress and
//! custom items are logged and streamed as they are produced. Both receive a
//! fresh [`TaskContext`] per attempt.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::retry::RetryConfig;
use crate::error::{Error, Result, TaskError};
use crate::event::TaskEvent;
use crate::model::{IdempotencyKey, TaskId, UserId, validate_task_name};

/// What a handler sees about the execution it runs in.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub idempotency_key: IdempotencyKey,
    pub user_id: Option<UserId>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled when the task is aborted.
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One item produced by a streaming handler.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    Progress(Value),
    Custom { name: String, data: Value },
    /// The final result. The stream is not polled after it.
    Result(Value),
}

pub type OnceFn =
    dyn Fn(Value, TaskContext) -> BoxFuture<'static, std::result::Result<Value, TaskError>>
        + Send
        + Sync;

pub type StreamingFn = dyn Fn(Value, TaskContext) -> BoxStream<'static, std::result::Result<HandlerOutput, TaskError>>
    + Send
    + Sync;

#[derive(Clone)]
pub enum TaskHandler {
    Once(Arc<OnceFn>),
    Streaming(Arc<StreamingFn>),
}

impl fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskHandler::Once(_) => f.write_str("TaskHandler::Once"),
            TaskHandler::Streaming(_) => f.write_str("TaskHandler::Streaming"),
        }
    }
}

impl TaskHandler {
    pub fn once<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, TaskError>> + Send + 'static,
    {
        TaskHandler::Once(Arc::new(move |input: Value, ctx: TaskContext| {
            f(input, ctx).boxed()
        }))
    }

    pub fn streaming<F, S>(f: F) -> Self
    where
        F: Fn(Value, TaskContext) -> S + Send + Sync + 'static,
        S: Stream<Item = std::result::Result<HandlerOutput, TaskError>> + Send + 'static,
    {
        TaskHandler::Streaming(Arc::new(move |input: Value, ctx: TaskContext| {
            f(input, ctx).boxed()
        }))
    }
}

/// History handed to a `recover` handler.
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    /// Stored events of the interrupted run, oldest first.
    pub previous_events: Vec<TaskEvent>,
    pub reason: String,
    pub time_since_last_event: Option<Duration>,
}

pub type RecoverFn = dyn Fn(Value, RecoveryContext, TaskContext) -> BoxFuture<'static, std::result::Result<Value, TaskError>>
    + Send
    + Sync;

pub type Validator = dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync;

/// A named task: handler plus optional recovery, retry policy and input
/// validation.
#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub handler: TaskHandler,
    pub recover: Option<Arc<RecoverFn>>,
    /// Falls back to the executor's default when unset.
    pub retry: Option<RetryConfig>,
    pub validator: Option<Arc<Validator>>,
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("handler", &self.handler)
            .field("recover", &self.recover.is_some())
            .field("retry", &self.retry)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, handler: TaskHandler) -> Self {
        Self {
            name: name.into(),
            handler,
            recover: None,
            retry: None,
            validator: None,
        }
    }

    pub fn with_recover<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value, RecoveryContext, TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, TaskError>> + Send + 'static,
    {
        self.recover = Some(Arc::new(
            move |input: Value, recovery: RecoveryContext, ctx: TaskContext| {
                f(input, recovery, ctx).boxed()
            },
        ));
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(f));
        self
    }

    /// Checks the name and, if one is set, runs the validator.
    pub fn validate_input(&self, input: &Value) -> Result<()> {
        validate_task_name(&self.name)?;
        match &self.validator {
            Some(validator) => validator(input)
                .map_err(|e| Error::Validation(format!("{}: {e}", self.name))),
            None => Ok(()),
        }
    }

    /// The `recover` handler bound to one recovery context, as a plain
    /// handler the executor can run. `None` without a `recover` handler.
    pub fn recovery_handler(&self, recovery: RecoveryContext) -> Option<TaskHandler> {
        let recover = Arc::clone(self.recover.as_ref()?);
        Some(TaskHandler::Once(Arc::new(move |input: Value, ctx: TaskContext| {
            recover(input, recovery.clone(), ctx)
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TaskContext {
        TaskContext {
            task_id: TaskId::generate(),
            idempotency_key: IdempotencyKey::new("k").unwrap(),
            user_id: None,
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn once_handler_runs() {
        let handler = TaskHandler::once(|input, _ctx| async move { Ok(input) });
        let TaskHandler::Once(f) = handler else {
            panic!("expected once handler");
        };
        assert_eq!(f(json!(1), ctx()).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn streaming_handler_yields_items() {
        let handler = TaskHandler::streaming(|input, _ctx| {
            futures::stream::iter(vec![
                Ok(HandlerOutput::Progress(json!({"pct": 50}))),
                Ok(HandlerOutput::Result(input)),
            ])
        });
        let TaskHandler::Streaming(f) = handler else {
            panic!("expected streaming handler");
        };
        let items: Vec<_> = f(json!("done"), ctx()).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1].as_ref().unwrap(),
            &HandlerOutput::Result(json!("done"))
        );
    }

    #[test]
    fn validator_rejects_input() {
        let def = TaskDefinition::new(
            "needs-x",
            TaskHandler::once(|input, _| async move { Ok(input) }),
        )
        .with_validator(|input| {
            if input.get("x").is_some() {
                Ok(())
            } else {
                Err("missing x".to_string())
            }
        });
        assert!(def.validate_input(&json!({"x": 1})).is_ok());
        assert!(matches!(
            def.validate_input(&json!({})),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn recovery_handler_sees_history() {
        let def = TaskDefinition::new("r", TaskHandler::once(|i, _| async move { Ok(i) }))
            .with_recover(|_input, recovery, _ctx| async move {
                Ok(json!({"seen": recovery.previous_events.len(), "reason": recovery.reason}))
            });
        let handler = def
            .recovery_handler(RecoveryContext {
                previous_events: Vec::new(),
                reason: "stale".into(),
                time_since_last_event: None,
            })
            .unwrap();
        let TaskHandler::Once(f) = handler else {
            panic!("expected once handler");
        };
        let out = f(json!(null), ctx()).await.unwrap();
        assert_eq!(out, json!({"seen": 0, "reason": "stale"}));
    }
}
