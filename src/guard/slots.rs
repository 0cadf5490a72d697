//! Execution slots: global, per-user and per-template concurrency ceilings.
//!
//! `reserve` either takes a slot immediately or parks a waiter and hands back
//! a [`SlotTicket`]; `wait` resolves the ticket. Callers that need a fixed
//! order reserve in that order and wait afterwards. `release` hands the freed
//! capacity to the first waiter (in arrival order) whose limits now fit,
//! incrementing the counters on its behalf before waking it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{Task, UserId};

use super::lock;

#[derive(Debug, Clone)]
pub struct SlotConfig {
    pub max_global: usize,
    pub max_per_user: usize,
    /// Optional ceilings keyed by task name.
    pub max_per_template: HashMap<String, usize>,
    /// How long a waiter may park before giving up.
    pub acquire_timeout: Duration,
    /// Parked waiters allowed at once.
    pub max_waiting: usize,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            max_global: 10,
            max_per_user: 5,
            max_per_template: HashMap::new(),
            acquire_timeout: Duration::from_secs(30),
            max_waiting: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlotStats {
    pub active: usize,
    pub waiting: usize,
    pub active_users: usize,
    pub per_template: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
struct Claim {
    user: Option<UserId>,
    template: String,
}

impl Claim {
    fn of(task: &Task) -> Self {
        Self {
            user: task.user_id.clone(),
            template: task.name.clone(),
        }
    }
}

/// A place in the slot queue.
#[derive(Debug)]
pub enum SlotTicket {
    /// The slot is held by the caller.
    Granted,
    Parked {
        id: u64,
        rx: oneshot::Receiver<()>,
        deadline: Instant,
    },
    /// Resolved without a slot, or handed over.
    Void,
}

impl SlotTicket {
    pub fn is_parked(&self) -> bool {
        matches!(self, SlotTicket::Parked { .. })
    }
}

struct Waiter {
    id: u64,
    claim: Claim,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    global: usize,
    per_user: HashMap<UserId, usize>,
    per_template: HashMap<String, usize>,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

pub struct SlotManager {
    config: SlotConfig,
    state: Mutex<State>,
}

impl SlotManager {
    pub fn new(config: SlotConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    fn fits(&self, state: &State, claim: &Claim) -> bool {
        if state.global >= self.config.max_global {
            return false;
        }
        if let Some(user) = &claim.user {
            if state.per_user.get(user).copied().unwrap_or(0) >= self.config.max_per_user {
                return false;
            }
        }
        if let Some(limit) = self.config.max_per_template.get(&claim.template) {
            if state.per_template.get(&claim.template).copied().unwrap_or(0) >= *limit {
                return false;
            }
        }
        true
    }

    fn take(state: &mut State, claim: &Claim) {
        state.global += 1;
        if let Some(user) = &claim.user {
            *state.per_user.entry(user.clone()).or_default() += 1;
        }
        *state.per_template.entry(claim.template.clone()).or_default() += 1;
    }

    fn give_back(state: &mut State, claim: &Claim) {
        state.global = state.global.saturating_sub(1);
        if let Some(user) = &claim.user {
            if let Some(n) = state.per_user.get_mut(user) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    state.per_user.remove(user);
                }
            }
        }
        if let Some(n) = state.per_template.get_mut(&claim.template) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                state.per_template.remove(&claim.template);
            }
        }
    }

    /// Takes a slot without waiting.
    pub fn try_acquire(&self, task: &Task) -> bool {
        let claim = Claim::of(task);
        let mut state = lock(&self.state);
        if self.fits(&state, &claim) {
            Self::take(&mut state, &claim);
            true
        } else {
            false
        }
    }

    /// Takes a slot, waiting up to `acquire_timeout` for one to free up.
    pub async fn acquire(&self, task: &Task) -> Result<()> {
        let mut ticket = self.reserve(task)?;
        self.wait(&mut ticket, task).await
    }

    /// Takes a slot now or queues behind the waiters already parked. The
    /// `acquire_timeout` starts here, not in [`SlotManager::wait`].
    pub fn reserve(&self, task: &Task) -> Result<SlotTicket> {
        let claim = Claim::of(task);
        let mut state = lock(&self.state);
        if self.fits(&state, &claim) {
            Self::take(&mut state, &claim);
            return Ok(SlotTicket::Granted);
        }
        state.waiters.retain(|w| !w.tx.is_closed());
        if state.waiters.len() >= self.config.max_waiting {
            return Err(Error::SlotsSaturated(format!(
                "{} waiters already parked",
                state.waiters.len()
            )));
        }
        let (tx, rx) = oneshot::channel();
        let id = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push_back(Waiter { id, claim, tx });
        debug!(
            idempotency_key = %task.idempotency_key,
            waiting = state.waiters.len(),
            "waiting for execution slot"
        );
        Ok(SlotTicket::Parked {
            id,
            rx,
            deadline: Instant::now() + self.config.acquire_timeout,
        })
    }

    /// Resolves a ticket. On success the ticket becomes `Granted`, otherwise
    /// `Void`. Dropping this future leaves a parked ticket parked.
    pub async fn wait(&self, ticket: &mut SlotTicket, task: &Task) -> Result<()> {
        let result = match ticket {
            SlotTicket::Granted => return Ok(()),
            SlotTicket::Void => {
                return Err(Error::SlotsSaturated("slot ticket already resolved".to_string()));
            }
            SlotTicket::Parked { id, rx, deadline } => {
                match tokio::time::timeout_at(*deadline, &mut *rx).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => {
                        Err(Error::SlotsSaturated("slot manager dropped waiter".to_string()))
                    }
                    Err(_) => self.expire(*id, rx, task),
                }
            }
        };
        *ticket = if result.is_ok() {
            SlotTicket::Granted
        } else {
            SlotTicket::Void
        };
        result
    }

    fn expire(&self, id: u64, rx: &mut oneshot::Receiver<()>, task: &Task) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
            state.waiters.remove(pos);
            drop(state);
            warn!(
                idempotency_key = %task.idempotency_key,
                timeout_ms = self.config.acquire_timeout.as_millis() as u64,
                "timed out waiting for execution slot"
            );
            return Err(Error::SlotTimeout(self.config.acquire_timeout));
        }
        // Granted between the timeout firing and taking the lock.
        match rx.try_recv() {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::SlotTimeout(self.config.acquire_timeout)),
        }
    }

    /// Gives up a ticket, releasing the slot if it was already granted.
    pub fn forfeit(&self, ticket: SlotTicket, task: &Task) {
        match ticket {
            SlotTicket::Granted => self.release(task),
            SlotTicket::Parked { id, mut rx, .. } => {
                {
                    let mut state = lock(&self.state);
                    if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                        state.waiters.remove(pos);
                        return;
                    }
                }
                if rx.try_recv().is_ok() {
                    self.release(task);
                }
            }
            SlotTicket::Void => {}
        }
    }

    /// Frees a slot and wakes the first waiter that now fits.
    pub fn release(&self, task: &Task) {
        let claim = Claim::of(task);
        let mut state = lock(&self.state);
        Self::give_back(&mut state, &claim);

        let mut i = 0;
        while i < state.waiters.len() {
            if !self.fits(&state, &state.waiters[i].claim) {
                i += 1;
                continue;
            }
            let Some(waiter) = state.waiters.remove(i) else {
                break;
            };
            Self::take(&mut state, &waiter.claim);
            if waiter.tx.send(()).is_ok() {
                break;
            }
            // Waiter gave up; keep scanning from the same position.
            Self::give_back(&mut state, &waiter.claim);
        }
    }

    /// Drops every parked waiter; their `acquire` calls fail.
    pub fn reject_waiters(&self) {
        lock(&self.state).waiters.clear();
    }

    pub fn active(&self) -> usize {
        lock(&self.state).global
    }

    pub fn waiting(&self) -> usize {
        lock(&self.state).waiters.len()
    }

    pub fn stats(&self) -> SlotStats {
        let state = lock(&self.state);
        SlotStats {
            active: state.global,
            waiting: state.waiters.len(),
            active_users: state.per_user.len(),
            per_template: state.per_template.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn task(name: &str, user: Option<&str>, n: i64) -> Task {
        Task::new(
            name,
            json!({ "n": n }),
            user.map(|u| UserId::new(u).unwrap()),
            None,
        )
        .unwrap()
    }

    fn manager(max_global: usize, max_per_user: usize) -> Arc<SlotManager> {
        Arc::new(SlotManager::new(SlotConfig {
            max_global,
            max_per_user,
            acquire_timeout: Duration::from_secs(5),
            ..SlotConfig::default()
        }))
    }

    #[test]
    fn per_user_limit() {
        let slots = manager(10, 1);
        assert!(slots.try_acquire(&task("a", Some("u"), 1)));
        assert!(!slots.try_acquire(&task("a", Some("u"), 2)));
        assert!(slots.try_acquire(&task("a", Some("v"), 3)));
        assert!(slots.try_acquire(&task("a", None, 4)));
    }

    #[test]
    fn per_template_limit() {
        let slots = SlotManager::new(SlotConfig {
            max_per_template: HashMap::from([("report".to_string(), 1)]),
            ..SlotConfig::default()
        });
        assert!(slots.try_acquire(&task("report", None, 1)));
        assert!(!slots.try_acquire(&task("report", None, 2)));
        assert!(slots.try_acquire(&task("echo", None, 3)));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out() {
        let slots = manager(1, 5);
        slots.acquire(&task("a", None, 1)).await.unwrap();
        let err = slots.acquire(&task("a", None, 2)).await.unwrap_err();
        assert!(matches!(err, Error::SlotTimeout(_)));
        assert_eq!(slots.waiting(), 0);
    }

    #[tokio::test]
    async fn release_wakes_first_compatible_waiter() {
        let slots = manager(2, 1);
        let a1 = task("a", Some("alice"), 1);
        let b1 = task("a", Some("bob"), 1);
        slots.acquire(&a1).await.unwrap();
        slots.acquire(&b1).await.unwrap();

        // alice's second task cannot run while alice holds a slot even if
        // bob frees one, so bob's waiter must be preferred.
        let a2 = task("a", Some("alice"), 2);
        let b2 = task("a", Some("bob"), 2);
        let s = Arc::clone(&slots);
        let a2_wait = tokio::spawn({
            let a2 = a2.clone();
            async move { s.acquire(&a2).await }
        });
        tokio::task::yield_now().await;
        let s = Arc::clone(&slots);
        let b2_wait = tokio::spawn({
            let b2 = b2.clone();
            async move { s.acquire(&b2).await }
        });
        while slots.waiting() < 2 {
            tokio::task::yield_now().await;
        }

        slots.release(&b1);
        b2_wait.await.unwrap().unwrap();
        assert_eq!(slots.waiting(), 1);

        slots.release(&a1);
        a2_wait.await.unwrap().unwrap();
        assert_eq!(slots.active(), 2);
    }

    #[tokio::test]
    async fn tickets_are_served_in_reservation_order() {
        let slots = manager(1, 5);
        let holder = task("a", None, 0);
        slots.acquire(&holder).await.unwrap();

        let queued: Vec<Task> = (1..=4).map(|n| task("a", None, n)).collect();
        let mut tickets: Vec<SlotTicket> = queued
            .iter()
            .map(|t| slots.reserve(t).unwrap())
            .collect();
        assert!(tickets.iter().all(SlotTicket::is_parked));

        slots.release(&holder);
        for (n, t) in queued.iter().enumerate() {
            slots.wait(&mut tickets[n], t).await.unwrap();
            assert!(matches!(tickets[n], SlotTicket::Granted));
            assert_eq!(slots.active(), 1);
            slots.release(t);
        }
        assert_eq!(slots.active(), 0);
    }

    #[tokio::test]
    async fn forfeiting_a_granted_ticket_passes_the_slot_on() {
        let slots = manager(1, 5);
        let first = task("a", None, 1);
        let second = task("a", None, 2);
        let third = task("a", None, 3);
        slots.acquire(&first).await.unwrap();
        let parked = slots.reserve(&second).unwrap();
        let mut behind = slots.reserve(&third).unwrap();

        // The slot reaches `second` before it gives up its place.
        slots.release(&first);
        slots.forfeit(parked, &second);
        slots.wait(&mut behind, &third).await.unwrap();
        assert_eq!(slots.active(), 1);
        assert_eq!(slots.waiting(), 0);
    }

    #[tokio::test]
    async fn forfeiting_a_parked_ticket_leaves_the_queue() {
        let slots = manager(1, 5);
        let first = task("a", None, 1);
        let second = task("a", None, 2);
        slots.acquire(&first).await.unwrap();
        let parked = slots.reserve(&second).unwrap();
        assert_eq!(slots.waiting(), 1);
        slots.forfeit(parked, &second);
        assert_eq!(slots.waiting(), 0);
        slots.release(&first);
        assert_eq!(slots.active(), 0);
    }

    #[tokio::test]
    async fn max_waiting_saturates() {
        let slots = Arc::new(SlotManager::new(SlotConfig {
            max_global: 1,
            max_waiting: 1,
            ..SlotConfig::default()
        }));
        slots.acquire(&task("a", None, 1)).await.unwrap();
        let s = Arc::clone(&slots);
        let _parked = tokio::spawn(async move { s.acquire(&task("a", None, 2)).await });
        while slots.waiting() < 1 {
            tokio::task::yield_now().await;
        }
        let err = slots.acquire(&task("a", None, 3)).await.unwrap_err();
        assert!(matches!(err, Error::SlotsSaturated(_)));
    }
}
