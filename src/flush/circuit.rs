//! Consecutive-failure circuit breaker for flush attempts.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    reset_after: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            reset_after,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    /// Whether attempts are blocked. An open breaker closes itself once
    /// `reset_after` has elapsed.
    pub fn is_open(&mut self) -> bool {
        match self.opened_at {
            Some(opened) if opened.elapsed() >= self.reset_after => {
                self.opened_at = None;
                self.consecutive_failures = 0;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Peeks without resetting.
    pub fn is_tripped(&self) -> bool {
        self.opened_at.is_some()
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// Returns true when this failure opened the breaker.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.opened_at.is_none() && self.consecutive_failures >= self.threshold {
            self.opened_at = Some(Instant::now());
            return true;
        }
        false
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
