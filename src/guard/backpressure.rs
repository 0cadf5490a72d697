//! Submission-rate and queue-depth admission.
//!
//! Sliding windows count recent submissions globally and per user. A
//! separate counter tracks tasks that were admitted but have not left the
//! admitted state yet, which bounds "queued but stuck" growth regardless of
//! execution throughput.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{BackpressureReason, Error, Result};
use crate::model::{Task, UserId};

use super::lock;

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    /// Length of the sliding windows.
    pub window: Duration,
    /// Submissions accepted per window across all users.
    pub max_global_per_window: usize,
    /// Submissions accepted per window for one user.
    pub max_user_per_window: usize,
    /// Admitted tasks allowed to wait for a slot at once.
    pub max_queue_size: usize,
    /// Retry-after reported when the queue is full.
    pub queue_retry_after: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_global_per_window: 1000,
            max_user_per_window: 100,
            max_queue_size: 1000,
            queue_retry_after: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackpressureStats {
    pub global_in_window: usize,
    pub tracked_users: usize,
    pub queued: usize,
}

#[derive(Default)]
struct State {
    global: VecDeque<Instant>,
    users: HashMap<UserId, VecDeque<Instant>>,
    queued: usize,
}

pub struct Backpressure {
    config: BackpressureConfig,
    state: Mutex<State>,
}

fn prune(window: &mut VecDeque<Instant>, cutoff: Option<Instant>) {
    let Some(cutoff) = cutoff else { return };
    while window.front().is_some_and(|t| *t <= cutoff) {
        window.pop_front();
    }
}

impl Backpressure {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Time until the oldest timestamp in a saturated window expires.
    fn window_retry_after(&self, window: &VecDeque<Instant>, now: Instant) -> Duration {
        window
            .front()
            .map(|oldest| self.config.window.saturating_sub(now - *oldest))
            .unwrap_or(self.config.window)
    }

    /// Admits a task or rejects it with a retry-after.
    ///
    /// `dead_lettered` is the remaining DLQ TTL when the task's key is
    /// quarantined.
    pub fn accept(&self, task: &Task, dead_lettered: Option<Duration>) -> Result<()> {
        if let Some(retry_after) = dead_lettered {
            return Err(Error::Backpressure {
                reason: BackpressureReason::DeadLettered,
                retry_after,
            });
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.config.window);
        let mut state = lock(&self.state);

        prune(&mut state.global, cutoff);
        if state.global.len() >= self.config.max_global_per_window {
            return Err(Error::Backpressure {
                reason: BackpressureReason::GlobalRateLimit,
                retry_after: self.window_retry_after(&state.global, now),
            });
        }

        if let Some(user) = &task.user_id {
            if let Some(window) = state.users.get_mut(user) {
                prune(window, cutoff);
                if window.len() >= self.config.max_user_per_window {
                    let retry_after = self.window_retry_after(window, now);
                    return Err(Error::Backpressure {
                        reason: BackpressureReason::UserRateLimit,
                        retry_after,
                    });
                }
            }
        }

        if state.queued >= self.config.max_queue_size {
            return Err(Error::Backpressure {
                reason: BackpressureReason::QueueFull,
                retry_after: self.config.queue_retry_after,
            });
        }

        state.global.push_back(now);
        if let Some(user) = &task.user_id {
            state.users.entry(user.clone()).or_default().push_back(now);
        }
        state.queued += 1;
        debug!(
            idempotency_key = %task.idempotency_key,
            queued = state.queued,
            "task admitted"
        );
        Ok(())
    }

    /// Counts a task back into the admitted queue without rate checks.
    pub fn enqueued(&self) {
        lock(&self.state).queued += 1;
    }

    /// A previously admitted task left the admitted state.
    pub fn dequeued(&self) {
        let mut state = lock(&self.state);
        state.queued = state.queued.saturating_sub(1);
    }

    pub fn queued(&self) -> usize {
        lock(&self.state).queued
    }

    /// Drops expired timestamps and empty user windows.
    pub fn cleanup(&self) {
        let cutoff = Instant::now().checked_sub(self.config.window);
        let mut state = lock(&self.state);
        prune(&mut state.global, cutoff);
        state.users.retain(|_, window| {
            prune(window, cutoff);
            !window.is_empty()
        });
    }

    pub fn stats(&self) -> BackpressureStats {
        let state = lock(&self.state);
        BackpressureStats {
            global_in_window: state.global.len(),
            tracked_users: state.users.len(),
            queued: state.queued,
        }
    }
}
