//! Task engine: definitions, execution, recovery and the orchestrating
//! [`TaskSystem`].

use std::sync::atomic::{AtomicBool, Ordering};

pub mod executor;
pub mod handler;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod system;

pub use executor::{ExecutionOutcome, ExecutorConfig, SharedTask, TaskExecutor};
pub use handler::{
    HandlerOutput, RecoveryContext, TaskContext, TaskDefinition, TaskHandler,
};
pub use recovery::{ReconnectOutcome, RecoveryConfig, RecoveryReport, TaskRecovery};
pub use registry::TaskRegistry;
pub use retry::RetryConfig;
pub use system::{
    RunOptions, ShutdownOptions, SystemStats, TaskHandle, TaskSystem, TaskSystemConfig,
    TaskTemplate,
};

/// Clears a single-flight flag when the guarded pass ends, however it ends.
pub(crate) struct ClearOnDrop<'a>(pub(crate) &'a AtomicBool);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
