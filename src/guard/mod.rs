//! Admission control.
//!
//! [`Guard`] composes three independent pieces: [`Backpressure`] (rate and
//! queue depth at submission), [`SlotManager`] (concurrency at execution) and
//! the [`DeadLetterQueue`]. It also owns a small pool of recovery slots that
//! throttles concurrent recoveries separately from normal execution.

pub mod backpressure;
pub mod dlq;
pub mod slots;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::Result;
use crate::model::Task;

pub use backpressure::{Backpressure, BackpressureConfig, BackpressureStats};
pub use dlq::{DeadLetterQueue, DlqConfig, DlqEntry, DlqEvent};
pub use slots::{SlotConfig, SlotManager, SlotStats, SlotTicket};

/// Guard state is plain counters and maps; a panic elsewhere cannot leave it
/// half-updated, so a poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub backpressure: BackpressureConfig,
    pub slots: SlotConfig,
    pub dlq: DlqConfig,
    /// Concurrent recoveries allowed.
    pub max_recovery_slots: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            backpressure: BackpressureConfig::default(),
            slots: SlotConfig::default(),
            dlq: DlqConfig::default(),
            max_recovery_slots: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GuardStats {
    pub backpressure: BackpressureStats,
    pub slots: SlotStats,
    pub dead_letters: usize,
    pub recovery_in_use: usize,
}

// ---------------------------------------------------------------------------
// Recovery slots
// ---------------------------------------------------------------------------

/// Bounded counter of in-flight recoveries.
#[derive(Debug)]
pub struct RecoverySlots {
    in_use: AtomicUsize,
    max: usize,
}

/// Held for the duration of one recovery; releases on drop.
#[derive(Debug)]
pub struct RecoverySlot {
    pool: Arc<RecoverySlots>,
}

impl Drop for RecoverySlot {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RecoverySlots {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            in_use: AtomicUsize::new(0),
            max,
        })
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<RecoverySlot> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            })
            .ok()
            .map(|_| RecoverySlot {
                pool: Arc::clone(self),
            })
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

pub struct Guard {
    backpressure: Backpressure,
    slots: SlotManager,
    dlq: Arc<DeadLetterQueue>,
    recovery: Arc<RecoverySlots>,
}

/// Decrements the admitted-queue counter however slot acquisition ends,
/// including the acquiring future being dropped.
struct Dequeue<'a>(&'a Backpressure);

impl Drop for Dequeue<'_> {
    fn drop(&mut self) {
        self.0.dequeued();
    }
}

impl Guard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            backpressure: Backpressure::new(config.backpressure),
            slots: SlotManager::new(config.slots),
            dlq: Arc::new(DeadLetterQueue::new(config.dlq)),
            recovery: RecoverySlots::new(config.max_recovery_slots),
        }
    }

    /// Starts background maintenance (DLQ expiry).
    pub fn start(&self) {
        self.dlq.spawn_cleanup();
    }

    pub fn backpressure(&self) -> &Backpressure {
        &self.backpressure
    }

    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    /// Admission at submission time.
    pub fn admit(&self, task: &Task) -> Result<()> {
        let dead_lettered = self.dlq.remaining_ttl(&task.idempotency_key);
        self.backpressure.accept(task, dead_lettered)
    }

    /// Re-queues a task released from the dead letter queue. Rate windows
    /// already counted it once.
    pub fn readmit(&self, task: &Task) {
        debug!(idempotency_key = %task.idempotency_key, "dead-lettered task readmitted");
        self.backpressure.enqueued();
    }

    /// Acquires an execution slot for an admitted task. The task leaves the
    /// admitted queue whether or not this succeeds.
    pub async fn acquire_slot(&self, task: &Task) -> Result<()> {
        let _dequeue = Dequeue(&self.backpressure);
        self.slots.acquire(task).await
    }

    /// Takes a place in the slot queue for an admitted task. Reservations
    /// are served in the order they are made. A failed reservation leaves the
    /// admitted queue at once.
    pub fn reserve_slot(self: &Arc<Self>, task: &Task) -> Result<SlotReservation> {
        match self.slots.reserve(task) {
            Ok(ticket) => Ok(SlotReservation {
                guard: Arc::clone(self),
                task: task.clone(),
                ticket,
            }),
            Err(e) => {
                self.backpressure.dequeued();
                Err(e)
            }
        }
    }

    pub fn release_slot(&self, task: &Task) {
        self.slots.release(task);
    }

    /// An admitted task was dropped before reaching a slot.
    pub fn discard(&self, task: &Task) {
        debug!(idempotency_key = %task.idempotency_key, "admitted task discarded");
        self.backpressure.dequeued();
    }

    pub fn dead_letter(&self, task: Task, reason: impl Into<String>, error: Option<String>) {
        self.dlq.add(task, reason, error);
    }

    pub fn recovery_slot(&self) -> Option<RecoverySlot> {
        self.recovery.try_acquire()
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            backpressure: self.backpressure.stats(),
            slots: self.slots.stats(),
            dead_letters: self.dlq.len(),
            recovery_in_use: self.recovery.in_use(),
        }
    }

    pub async fn shutdown(&self) {
        self.slots.reject_waiters();
        self.dlq.shutdown().await;
    }
}

/// A reserved place in the slot queue. The task leaves the admitted queue
/// when this is dropped; an unclaimed place or slot is given back.
pub struct SlotReservation {
    guard: Arc<Guard>,
    task: Task,
    ticket: SlotTicket,
}

impl SlotReservation {
    /// Waits for the slot. Once this returns `Ok` the caller owns the slot
    /// and frees it with [`Guard::release_slot`].
    pub async fn acquire(mut self) -> Result<()> {
        let result = self.guard.slots.wait(&mut self.ticket, &self.task).await;
        if result.is_ok() {
            self.ticket = SlotTicket::Void;
        }
        result
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.guard.backpressure.dequeued();
        let ticket = std::mem::replace(&mut self.ticket, SlotTicket::Void);
        self.guard.slots.forfeit(ticket, &self.task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recovery_slots_release_on_drop() {
        let pool = RecoverySlots::new(2);
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn slot_failure_still_dequeues() {
        let guard = Guard::new(GuardConfig {
            slots: SlotConfig {
                max_global: 0,
                max_waiting: 0,
                ..SlotConfig::default()
            },
            ..GuardConfig::default()
        });
        let task = Task::new("echo", json!({}), None, None).unwrap();
        guard.admit(&task).unwrap();
        assert_eq!(guard.backpressure().queued(), 1);
        assert!(guard.acquire_slot(&task).await.is_err());
        assert_eq!(guard.backpressure().queued(), 0);
    }

    #[tokio::test]
    async fn dropped_reservation_returns_its_slot() {
        let guard = Arc::new(Guard::new(GuardConfig {
            slots: SlotConfig {
                max_global: 1,
                ..SlotConfig::default()
            },
            ..GuardConfig::default()
        }));
        let first = Task::new("echo", json!(1), None, None).unwrap();
        let second = Task::new("echo", json!(2), None, None).unwrap();
        guard.admit(&first).unwrap();
        guard.admit(&second).unwrap();

        guard.reserve_slot(&first).unwrap().acquire().await.unwrap();
        let parked = guard.reserve_slot(&second).unwrap();
        assert_eq!(guard.slots().waiting(), 1);
        assert_eq!(guard.backpressure().queued(), 1);

        guard.release_slot(&first);
        drop(parked);
        assert_eq!(guard.slots().active(), 0);
        assert_eq!(guard.backpressure().queued(), 0);
    }

    #[tokio::test]
    async fn dead_lettered_key_is_not_admitted() {
        let guard = Guard::new(GuardConfig::default());
        let task = Task::new("echo", json!({}), None, None).unwrap();
        guard.dead_letter(task.clone(), "slot_rejected", None);
        let err = guard.admit(&task).unwrap_err();
        assert_eq!(err.as_label(), "backpressure");
        assert!(err.retry_after().is_some());
    }
}
