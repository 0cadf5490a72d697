//! Dead letter queue.
//!
//! Capacity-bounded and keyed by idempotency key. Entries leave on manual
//! retry, TTL expiry or capacity eviction (oldest first). Every change is
//! published on a broadcast channel.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::model::{IdempotencyKey, Task, TaskStatus};

use super::lock;

#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub max_size: usize,
    pub ttl: Duration,
    /// Manual retries allowed per key before it is dropped for good.
    pub max_retries: u32,
    pub cleanup_interval: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: Duration::from_secs(24 * 3600),
            max_retries: 3,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    pub task: Task,
    pub added_at: DateTime<Utc>,
    pub reason: String,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DlqEvent {
    Added {
        key: IdempotencyKey,
        reason: String,
    },
    Removed {
        key: IdempotencyKey,
    },
    Retried {
        key: IdempotencyKey,
        retry_count: u32,
    },
    Expired {
        key: IdempotencyKey,
    },
    Evicted {
        key: IdempotencyKey,
    },
    RetryExhausted {
        key: IdempotencyKey,
        retries: u32,
    },
}

struct Slot {
    entry: DlqEntry,
    added: Instant,
}

#[derive(Default)]
struct State {
    entries: HashMap<IdempotencyKey, Slot>,
    order: VecDeque<IdempotencyKey>,
    /// Retry counts survive a retried task failing back into the queue.
    history: HashMap<IdempotencyKey, (u32, DateTime<Utc>)>,
}

impl State {
    fn take(&mut self, key: &IdempotencyKey) -> Option<Slot> {
        let slot = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(slot)
    }
}

pub struct DeadLetterQueue {
    config: DlqConfig,
    state: Mutex<State>,
    events: broadcast::Sender<DlqEvent>,
    cancel: CancellationToken,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeadLetterQueue {
    pub fn new(config: DlqConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            state: Mutex::new(State::default()),
            events,
            cancel: CancellationToken::new(),
            cleanup_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DlqEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: DlqEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Starts the periodic TTL sweep.
    pub fn spawn_cleanup(self: &Arc<Self>) {
        let dlq = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        dlq.cleanup_expired();
                    }
                }
            }
        });
        *lock(&self.cleanup_task) = Some(handle);
    }

    /// Quarantines a task. Re-adding an existing key updates it in place.
    pub fn add(&self, task: Task, reason: impl Into<String>, error: Option<String>) {
        let reason = reason.into();
        let key = task.idempotency_key.clone();
        let mut evicted = Vec::new();
        {
            let mut state = lock(&self.state);
            if let Some(slot) = state.entries.get_mut(&key) {
                slot.entry.task = task;
                slot.entry.reason = reason.clone();
                slot.entry.error = error;
            } else {
                while state.entries.len() >= self.config.max_size.max(1) {
                    let Some(oldest) = state.order.pop_front() else {
                        break;
                    };
                    state.entries.remove(&oldest);
                    state.history.remove(&oldest);
                    evicted.push(oldest);
                }
                let (retry_count, last_retry_at) = state
                    .history
                    .get(&key)
                    .map(|(n, at)| (*n, Some(*at)))
                    .unwrap_or((0, None));
                state.entries.insert(
                    key.clone(),
                    Slot {
                        entry: DlqEntry {
                            task,
                            added_at: Utc::now(),
                            reason: reason.clone(),
                            retry_count,
                            last_retry_at,
                            error,
                        },
                        added: Instant::now(),
                    },
                );
                state.order.push_back(key.clone());
            }
        }

        for key in evicted {
            warn!(idempotency_key = %key, "dead letter queue full, evicted oldest entry");
            self.publish(DlqEvent::Evicted { key });
        }
        info!(idempotency_key = %key, reason = %reason, "task dead-lettered");
        self.publish(DlqEvent::Added { key, reason });
    }

    pub fn contains(&self, key: &IdempotencyKey) -> bool {
        lock(&self.state).entries.contains_key(key)
    }

    pub fn get(&self, key: &IdempotencyKey) -> Option<DlqEntry> {
        lock(&self.state).entries.get(key).map(|s| s.entry.clone())
    }

    /// Time left before the entry for `key` expires.
    pub fn remaining_ttl(&self, key: &IdempotencyKey) -> Option<Duration> {
        let state = lock(&self.state);
        let slot = state.entries.get(key)?;
        Some(self.config.ttl.saturating_sub(slot.added.elapsed()))
    }

    /// Removes the entry and resets its task to `created`.
    ///
    /// Once an entry has been retried `max_retries` times, retrying it again
    /// drops it for good and returns [`Error::DlqRetryExhausted`].
    pub fn retry(&self, key: &IdempotencyKey) -> Result<Task> {
        let mut state = lock(&self.state);
        let slot = state
            .take(key)
            .ok_or_else(|| Error::NotFound(format!("dead letter {key}")))?;

        let retries = slot.entry.retry_count;
        if retries >= self.config.max_retries {
            state.history.remove(key);
            drop(state);
            warn!(idempotency_key = %key, retries, "dead letter retries exhausted");
            self.publish(DlqEvent::RetryExhausted {
                key: key.clone(),
                retries,
            });
            return Err(Error::DlqRetryExhausted {
                key: key.to_string(),
                retries,
            });
        }

        let mut task = slot.entry.task;
        if task.status == TaskStatus::Failed {
            task.reset_for_retry()?;
        }
        let retry_count = retries + 1;
        state.history.insert(key.clone(), (retry_count, Utc::now()));
        drop(state);

        info!(idempotency_key = %key, retry_count, "dead letter retried");
        self.publish(DlqEvent::Retried {
            key: key.clone(),
            retry_count,
        });
        Ok(task)
    }

    /// Removes an entry without retrying it.
    pub fn remove(&self, key: &IdempotencyKey) -> Option<DlqEntry> {
        let slot = {
            let mut state = lock(&self.state);
            state.history.remove(key);
            state.take(key)?
        };
        self.publish(DlqEvent::Removed { key: key.clone() });
        Some(slot.entry)
    }

    /// Forgets the retry count of a key whose task finally succeeded.
    pub fn clear_history(&self, key: &IdempotencyKey) {
        lock(&self.state).history.remove(key);
    }

    /// Drops entries older than the TTL. Returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let expired: Vec<IdempotencyKey> = {
            let mut state = lock(&self.state);
            let ttl = self.config.ttl;
            let keys: Vec<IdempotencyKey> = state
                .entries
                .iter()
                .filter(|(_, slot)| slot.added.elapsed() >= ttl)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                state.take(key);
                state.history.remove(key);
            }
            keys
        };
        for key in &expired {
            info!(idempotency_key = %key, "dead letter expired");
            self.publish(DlqEvent::Expired { key: key.clone() });
        }
        expired.len()
    }

    /// Entries oldest first.
    pub fn entries(&self) -> Vec<DlqEntry> {
        let state = lock(&self.state);
        state
            .order
            .iter()
            .filter_map(|k| state.entries.get(k))
            .map(|s| s.entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = lock(&self.cleanup_task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
