//! Moving WAL entries into the queryable repository.
//!
//! [`FlushWorker`] does the work; [`FlushManager`] runs it (normally as a
//! `taskd flush-worker` child process) and restarts it when it dies.

pub mod circuit;
pub mod manager;
pub mod protocol;
pub mod worker;

pub use circuit::CircuitBreaker;
pub use manager::{FlushManager, FlushManagerConfig, FlushMode};
pub use protocol::{WorkerCommand, WorkerMessage};
pub use worker::{FlushWorker, FlushWorkerConfig, FlushWorkerStats};
