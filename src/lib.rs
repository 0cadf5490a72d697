//! # taskwal
//!
//! Durable at-least-once task execution.
//!
//! Every task lifecycle event is appended to a checksummed write-ahead log
//! before it is visible anywhere else. A flush worker (normally a child
//! process) moves the log into a queryable [`storage::TaskRepository`];
//! admission control, execution slots and a dead letter queue sit in front
//! of execution; subscribers follow progress through resumable streams; and
//! tasks whose heartbeat stops are recovered.
//!
//! [`engine::TaskSystem`] ties it all together.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod flush;
pub mod guard;
pub mod model;
pub mod ring_buffer;
pub mod storage;
pub mod stream;
pub mod telemetry;
pub mod wal;

pub use engine::{
    RunOptions, TaskDefinition, TaskHandle, TaskHandler, TaskRegistry, TaskSystem,
    TaskSystemConfig,
};
pub use error::{Error, Result, TaskError};
pub use event::{TaskEvent, TaskEventKind};
pub use model::{IdempotencyKey, Task, TaskId, TaskStatus, TaskType, UserId};
