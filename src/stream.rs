//! Per-task event streams with replay.
//!
//! Each idempotency key gets a bounded [`RingBuffer`] of [`StreamTaskEvent`]s
//! and its own seq space. Subscribers resume by passing the last seq they
//! saw; if that seq has already been evicted the generator fails with
//! [`Error::StreamOverflow`] and the client must resync from the repository.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::TaskEvent;
use crate::guard::lock;
use crate::model::IdempotencyKey;
use crate::ring_buffer::RingBuffer;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub buffer_capacity: usize,
    /// How long a closed stream stays readable.
    pub retention: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            retention: Duration::from_secs(60),
        }
    }
}

/// A task event with its per-stream seq.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTaskEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: TaskEvent,
}

#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Last seq the client saw; 0 replays everything retained.
    pub last_seq: u64,
    /// Ends the generator quietly when cancelled.
    pub cancel: Option<CancellationToken>,
}

/// What a listener is told.
#[derive(Debug, Clone, Copy)]
pub enum StreamNotification<'a> {
    Event(&'a StreamTaskEvent),
    Closed,
}

pub type Listener = Arc<dyn Fn(StreamNotification<'_>) + Send + Sync>;
pub type ListenerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStats {
    pub active_streams: usize,
    pub closed_streams: usize,
    pub overflowed_events: u64,
}

struct TaskStream {
    buffer: RingBuffer<u64, StreamTaskEvent>,
    last_seq: u64,
    closed: bool,
    /// Bumped on every close so a stale deletion timer leaves a reopened
    /// stream alone.
    epoch: u64,
    listeners: Vec<(ListenerId, Listener)>,
    version: watch::Sender<u64>,
}

impl TaskStream {
    fn new(capacity: usize) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            buffer: RingBuffer::new(capacity),
            last_seq: 0,
            closed: false,
            epoch: 0,
            listeners: Vec::new(),
            version,
        }
    }

    fn wake(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

type Streams = Arc<Mutex<HashMap<IdempotencyKey, TaskStream>>>;

pub struct StreamManager {
    config: StreamConfig,
    streams: Streams,
    next_listener: AtomicU64,
    overflowed: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl StreamManager {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            streams: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(1),
            overflowed: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    /// Creates the stream for `key`, or reopens it if it was closed. Seqs
    /// continue where the previous run left off.
    pub fn create_stream(&self, key: &IdempotencyKey) {
        let mut streams = lock(&self.streams);
        let stream = streams
            .entry(key.clone())
            .or_insert_with(|| TaskStream::new(self.config.buffer_capacity));
        if stream.closed {
            stream.closed = false;
            stream.epoch += 1;
        }
    }

    pub fn has_stream(&self, key: &IdempotencyKey) -> bool {
        lock(&self.streams).contains_key(key)
    }

    pub fn is_closed(&self, key: &IdempotencyKey) -> Option<bool> {
        lock(&self.streams).get(key).map(|s| s.closed)
    }

    /// Appends an event and notifies listeners. Returns the assigned seq, or
    /// `None` if the stream is closed.
    pub fn push(&self, key: &IdempotencyKey, event: TaskEvent) -> Option<u64> {
        let (item, listeners) = {
            let mut streams = lock(&self.streams);
            let stream = streams
                .entry(key.clone())
                .or_insert_with(|| TaskStream::new(self.config.buffer_capacity));
            if stream.closed {
                debug!(idempotency_key = %key, kind = event.kind.name(), "push to closed stream dropped");
                return None;
            }
            stream.last_seq += 1;
            let item = StreamTaskEvent {
                seq: stream.last_seq,
                event,
            };
            if stream.buffer.push(item.seq, item.clone()).is_some() {
                self.overflowed.fetch_add(1, Ordering::Relaxed);
            }
            stream.wake();
            let listeners: Vec<Listener> = stream.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (item, listeners)
        };

        for listener in listeners {
            listener(StreamNotification::Event(&item));
        }
        Some(item.seq)
    }

    /// Marks the stream closed, wakes everyone, and schedules deletion after
    /// the retention window.
    pub fn close(&self, key: &IdempotencyKey) {
        let (epoch, listeners) = {
            let mut streams = lock(&self.streams);
            let Some(stream) = streams.get_mut(key) else {
                return;
            };
            if stream.closed {
                return;
            }
            stream.closed = true;
            stream.epoch += 1;
            stream.wake();
            let listeners: Vec<Listener> = stream.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (stream.epoch, listeners)
        };

        for listener in listeners {
            listener(StreamNotification::Closed);
        }

        let streams = Arc::clone(&self.streams);
        let cancel = self.cancel.clone();
        let retention = self.config.retention;
        let key = key.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(retention) => {
                    let mut streams = lock(&streams);
                    if streams.get(&key).is_some_and(|s| s.closed && s.epoch == epoch) {
                        streams.remove(&key);
                        debug!(idempotency_key = %key, "closed stream deleted");
                    }
                }
            }
        });
    }

    pub fn add_listener(&self, key: &IdempotencyKey, listener: Listener) -> Option<ListenerId> {
        let mut streams = lock(&self.streams);
        let stream = streams.get_mut(key)?;
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        stream.listeners.push((id, listener));
        Some(id)
    }

    pub fn remove_listener(&self, key: &IdempotencyKey, id: ListenerId) -> bool {
        let mut streams = lock(&self.streams);
        let Some(stream) = streams.get_mut(key) else {
            return false;
        };
        let before = stream.listeners.len();
        stream.listeners.retain(|(lid, _)| *lid != id);
        stream.listeners.len() != before
    }

    /// Events currently retained for `key`, oldest first.
    pub fn snapshot(&self, key: &IdempotencyKey) -> Vec<StreamTaskEvent> {
        lock(&self.streams)
            .get(key)
            .map(|s| s.buffer.values().cloned().collect())
            .unwrap_or_default()
    }

    /// A cancellable sequence of events with `seq > options.last_seq`.
    ///
    /// Yields what is buffered, then waits for pushes until the stream is
    /// closed, deleted, or the cancel token fires.
    pub fn create_generator(
        &self,
        key: &IdempotencyKey,
        options: StreamOptions,
    ) -> BoxStream<'static, Result<StreamTaskEvent>> {
        let state = Generator {
            streams: Arc::clone(&self.streams),
            key: key.clone(),
            last_seq: options.last_seq,
            cancel: options.cancel.unwrap_or_default(),
            rx: None,
            pending: VecDeque::new(),
            seen: false,
            done: false,
        };
        stream::unfold(state, |mut g| async move {
            let item = g.next_item().await?;
            Some((item, g))
        })
        .boxed()
    }

    pub fn stats(&self) -> StreamStats {
        let streams = lock(&self.streams);
        let closed = streams.values().filter(|s| s.closed).count();
        StreamStats {
            active_streams: streams.len() - closed,
            closed_streams: closed,
            overflowed_events: self.overflowed.load(Ordering::Relaxed),
        }
    }

    /// Closes every open stream.
    pub fn close_all(&self) {
        let keys: Vec<IdempotencyKey> = lock(&self.streams)
            .iter()
            .filter(|(_, s)| !s.closed)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.close(&key);
        }
    }

    /// Cancels deletion timers and drops every stream.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        lock(&self.streams).clear();
    }
}

struct Generator {
    streams: Streams,
    key: IdempotencyKey,
    last_seq: u64,
    cancel: CancellationToken,
    rx: Option<watch::Receiver<u64>>,
    pending: VecDeque<StreamTaskEvent>,
    /// The stream existed at least once for this generator.
    seen: bool,
    done: bool,
}

enum Snapshot {
    Missing,
    Overflow { oldest: u64 },
    Events { events: Vec<StreamTaskEvent>, closed: bool },
}

impl Generator {
    fn snapshot(&mut self) -> Snapshot {
        let streams = lock(&self.streams);
        let Some(stream) = streams.get(&self.key) else {
            return Snapshot::Missing;
        };
        match &mut self.rx {
            Some(rx) => {
                rx.borrow_and_update();
            }
            None => self.rx = Some(stream.version.subscribe()),
        }

        if let Some((&oldest, _)) = stream.buffer.front() {
            if self.last_seq != 0 && self.last_seq + 1 < oldest {
                return Snapshot::Overflow { oldest };
            }
        }
        let events = stream
            .buffer
            .values()
            .filter(|e| e.seq > self.last_seq)
            .cloned()
            .collect();
        Snapshot::Events {
            events,
            closed: stream.closed,
        }
    }

    async fn next_item(&mut self) -> Option<Result<StreamTaskEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.done || self.cancel.is_cancelled() {
                return None;
            }

            match self.snapshot() {
                Snapshot::Missing => {
                    self.done = true;
                    if self.seen {
                        return None;
                    }
                    return Some(Err(Error::NotFound(format!("stream {}", self.key))));
                }
                Snapshot::Overflow { oldest } => {
                    self.done = true;
                    return Some(Err(Error::StreamOverflow {
                        requested: self.last_seq,
                        oldest,
                    }));
                }
                Snapshot::Events { events, closed } => {
                    self.seen = true;
                    if let Some(last) = events.last() {
                        self.last_seq = last.seq;
                    }
                    let empty = events.is_empty();
                    self.pending.extend(events);
                    if closed {
                        self.done = true;
                        continue;
                    }
                    if !empty {
                        continue;
                    }
                }
            }

            let Some(rx) = self.rx.as_mut() else {
                return None;
            };
            let deleted = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                changed = rx.changed() => changed.is_err(),
            };
            if deleted {
                self.rx = None;
                self.done = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TaskEventKind;
    use crate::model::Task;
    use serde_json::json;

    fn progress(task: &Task, n: i64) -> TaskEvent {
        TaskEvent::new(task, TaskEventKind::Progress { data: json!(n) })
    }

    #[tokio::test]
    async fn seqs_are_per_stream() {
        let streams = StreamManager::new(StreamConfig::default());
        let a = Task::new("a", json!(1), None, None).unwrap();
        let b = Task::new("b", json!(1), None, None).unwrap();
        assert_eq!(streams.push(&a.idempotency_key, progress(&a, 1)), Some(1));
        assert_eq!(streams.push(&a.idempotency_key, progress(&a, 2)), Some(2));
        assert_eq!(streams.push(&b.idempotency_key, progress(&b, 1)), Some(1));
    }

    #[tokio::test]
    async fn listeners_fire_synchronously() {
        let streams = StreamManager::new(StreamConfig::default());
        let t = Task::new("a", json!(1), None, None).unwrap();
        let key = t.idempotency_key.clone();
        streams.create_stream(&key);

        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let id = streams
            .add_listener(
                &key,
                Arc::new(move |n: StreamNotification<'_>| {
                    if let StreamNotification::Event(e) = n {
                        counter.store(e.seq, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();
        streams.push(&key, progress(&t, 1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(streams.remove_listener(&key, id));
        streams.push(&key, progress(&t, 2));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_stream_rejects_pushes() {
        let streams = StreamManager::new(StreamConfig::default());
        let t = Task::new("a", json!(1), None, None).unwrap();
        streams.create_stream(&t.idempotency_key);
        streams.close(&t.idempotency_key);
        assert_eq!(streams.push(&t.idempotency_key, progress(&t, 1)), None);
        assert_eq!(streams.is_closed(&t.idempotency_key), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn closed_stream_is_deleted_after_retention() {
        let streams = StreamManager::new(StreamConfig {
            buffer_capacity: 10,
            retention: Duration::from_secs(5),
        });
        let t = Task::new("a", json!(1), None, None).unwrap();
        let key = t.idempotency_key.clone();
        streams.push(&key, progress(&t, 1));
        streams.close(&key);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(streams.has_stream(&key));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!streams.has_stream(&key));
    }
}
