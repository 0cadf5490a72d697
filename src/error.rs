//! Error types for taskwal.
//!
//! [`Error`] is what the engine itself returns: admission rejections, state
//! machine violations, persistence and WAL failures. [`TaskError`] is what a
//! task handler returns; the executor classifies it to decide whether another
//! attempt is worth making.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::model::TaskStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rejected by backpressure ({reason}), retry after {retry_after:?}")]
    Backpressure {
        reason: BackpressureReason,
        retry_after: Duration,
    },

    #[error("timed out after {0:?} waiting for an execution slot")]
    SlotTimeout(Duration),

    #[error("execution slots saturated: {0}")]
    SlotsSaturated(String),

    #[error("retries exhausted after {attempts} attempts: {cause}")]
    RetryExhausted { attempts: u32, cause: String },

    #[error("dead letter retries exhausted for {key} after {retries} retries")]
    DlqRetryExhausted { key: String, retries: u32 },

    #[error("stream overflow: last seen seq {requested}, oldest retained seq {oldest}")]
    StreamOverflow { requested: u64, oldest: u64 },

    #[error("persistence error during {operation}: {message}")]
    Persistence {
        operation: String,
        message: String,
        retryable: bool,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("ipc error: {0}")]
    Ipc(String),

    #[error("task system is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short stable label for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::InvalidTransition { .. } => "invalid_transition",
            Error::Forbidden(_) => "forbidden",
            Error::Backpressure { .. } => "backpressure",
            Error::SlotTimeout(_) => "slot_timeout",
            Error::SlotsSaturated(_) => "slots_saturated",
            Error::RetryExhausted { .. } => "retry_exhausted",
            Error::DlqRetryExhausted { .. } => "dlq_retry_exhausted",
            Error::StreamOverflow { .. } => "stream_overflow",
            Error::Persistence { .. } => "persistence",
            Error::Database(_) => "database",
            Error::InvalidPath(_) => "invalid_path",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Config(_) => "config",
            Error::Ipc(_) => "ipc",
            Error::ShuttingDown => "shutting_down",
            Error::Other(_) => "other",
        }
    }

    /// Whether the caller may try the same operation again later.
    ///
    /// Backpressure and slot errors are retryable with the carried delay.
    /// State, validation and path errors are programming or input errors
    /// and never are. A stream overflow means "resync from the repository",
    /// not "retry the stream".
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Backpressure { .. } | Error::SlotTimeout(_) | Error::SlotsSaturated(_) => true,
            Error::Persistence { retryable, .. } => *retryable,
            Error::Database(e) => database_error_is_retryable(e),
            Error::Io(_) | Error::Ipc(_) => true,
            _ => false,
        }
    }

    /// Server-supplied delay for backpressure rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Backpressure { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub(crate) fn persistence(
        operation: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Error::Persistence {
            operation: operation.into(),
            message: message.into(),
            retryable,
        }
    }
}

fn database_error_is_retryable(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
    ) || e
        .as_database_error()
        .map(|db| {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        })
        .unwrap_or(false)
}

/// Why backpressure rejected a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureReason {
    /// The idempotency key is quarantined in the dead letter queue.
    DeadLettered,
    /// The global sliding window is full.
    GlobalRateLimit,
    /// The submitting user's sliding window is full.
    UserRateLimit,
    /// Too many admitted tasks are waiting to execute.
    QueueFull,
}

impl fmt::Display for BackpressureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackpressureReason::DeadLettered => "dead_lettered",
            BackpressureReason::GlobalRateLimit => "global_rate_limit",
            BackpressureReason::UserRateLimit => "user_rate_limit",
            BackpressureReason::QueueFull => "queue_full",
        };
        write!(f, "{s}")
    }
}

/// Errors returned by task handlers.
///
/// Explicit kinds carry their own retry decision. [`TaskError::Unknown`] is
/// classified by message: network-looking failures are retryable, and so is
/// everything else, because an unnecessary retry is cheaper than a lost task.
#[non_exhaustive]
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// Transient failure; always retried while attempts remain.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Permanent failure; never retried.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The input was rejected by the handler; never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The handler observed its abort signal.
    #[error("cancelled")]
    Cancelled,

    /// Anything else.
    #[error("{0}")]
    Unknown(String),
}

/// Outcome of [`TaskError::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retryable: bool,
    /// Which rule decided: `explicit`, `network` or `unknown`.
    pub rule: &'static str,
}

const NETWORK_PATTERNS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "etimedout",
    "enotfound",
    "epipe",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "timed out",
    "timeout",
    "network",
    "socket hang up",
    "temporarily unavailable",
];

impl TaskError {
    /// Wraps any displayable error as [`TaskError::Unknown`].
    pub fn other(e: impl fmt::Display) -> Self {
        TaskError::Unknown(e.to_string())
    }

    pub fn classify(&self) -> RetryDecision {
        match self {
            TaskError::Retryable(_) => RetryDecision {
                retryable: true,
                rule: "explicit",
            },
            TaskError::Fatal(_) | TaskError::Validation(_) | TaskError::Cancelled => {
                RetryDecision {
                    retryable: false,
                    rule: "explicit",
                }
            }
            TaskError::Unknown(msg) => {
                let lower = msg.to_ascii_lowercase();
                if NETWORK_PATTERNS.iter().any(|p| lower.contains(p)) {
                    RetryDecision {
                        retryable: true,
                        rule: "network",
                    }
                } else {
                    RetryDecision {
                        retryable: true,
                        rule: "unknown",
                    }
                }
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classify().retryable
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Retryable(_) => "task_retryable",
            TaskError::Fatal(_) => "task_fatal",
            TaskError::Validation(_) => "task_validation",
            TaskError::Cancelled => "task_cancelled",
            TaskError::Unknown(_) => "task_unknown",
        }
    }
}
