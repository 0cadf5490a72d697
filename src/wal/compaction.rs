//! Compaction of rotated WAL generations.
//!
//! Rules, applied to one rotated file at a time:
//! - with a flush cursor, nothing above the cursor is dropped, heartbeats
//!   included, so the repository still sees the latest liveness;
//! - heartbeats are dropped;
//! - entries of a task that completed are dropped;
//! - entries of a failed or cancelled task are dropped once its terminal
//!   record is older than the terminal retention.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::{TaskId, TaskStatus};

use super::entry::{EventLogEntryType, EventLogEvent};

/// Where compaction may drop entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushCursor {
    /// Ignore the flush worker's cursor.
    Ignore,
    /// Only entries at or below this seq have reached the repository.
    At(u64),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub kept: usize,
    pub dropped_heartbeats: usize,
    pub dropped_completed: usize,
    pub dropped_expired: usize,
}

impl CompactionStats {
    pub fn dropped(&self) -> usize {
        self.dropped_heartbeats + self.dropped_completed + self.dropped_expired
    }
}

/// Terminal status and time of every task that finished in `events`.
fn terminal_states(events: &[EventLogEvent]) -> HashMap<TaskId, (TaskStatus, DateTime<Utc>)> {
    let mut out = HashMap::new();
    for event in events {
        let status = match event.entry.entry_type {
            EventLogEntryType::TaskComplete => event
                .entry
                .payload
                .get("status")
                .and_then(|s| s.as_str())
                .and_then(|s| s.parse::<TaskStatus>().ok()),
            EventLogEntryType::TaskCancelled => Some(TaskStatus::Cancelled),
            _ => None,
        };
        if let Some(status) = status {
            out.insert(event.entry.task_id.clone(), (status, event.entry.timestamp));
        }
    }
    out
}

pub fn compact(
    events: Vec<EventLogEvent>,
    now: DateTime<Utc>,
    terminal_retention: Duration,
    cursor: FlushCursor,
) -> (Vec<EventLogEvent>, CompactionStats) {
    let terminal = terminal_states(&events);
    let retention = chrono::Duration::from_std(terminal_retention).unwrap_or(chrono::Duration::MAX);
    let mut stats = CompactionStats::default();
    let mut kept = Vec::with_capacity(events.len());

    for event in events {
        if matches!(cursor, FlushCursor::At(flushed) if event.seq > flushed) {
            kept.push(event);
            continue;
        }
        if event.entry.entry_type == EventLogEntryType::TaskHeartbeat {
            stats.dropped_heartbeats += 1;
            continue;
        }
        match terminal.get(&event.entry.task_id) {
            Some((TaskStatus::Completed, _)) => {
                stats.dropped_completed += 1;
            }
            Some((TaskStatus::Failed | TaskStatus::Cancelled, at)) if now - *at > retention => {
                stats.dropped_expired += 1;
            }
            _ => kept.push(event),
        }
    }

    stats.kept = kept.len();
    (kept, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IdempotencyKey;
    use crate::wal::entry::EventLogEntry;
    use serde_json::json;

    fn event(seq: u64, task: &str, entry_type: EventLogEntryType, at: DateTime<Utc>) -> EventLogEvent {
        let payload = match entry_type {
            EventLogEntryType::TaskComplete if task.starts_with("ok") => json!({"status": "completed"}),
            EventLogEntryType::TaskComplete => json!({"status": "failed"}),
            _ => json!({}),
        };
        EventLogEvent::seal(
            EventLogEntry {
                entry_type,
                task_id: TaskId::new(task).unwrap(),
                idempotency_key: IdempotencyKey::new(format!("key-{task}")).unwrap(),
                event_id: format!("{task}-{seq}"),
                timestamp: at,
                payload,
            },
            seq,
        )
        .unwrap()
    }

    #[test]
    fn drops_completed_and_heartbeats() {
        let now = Utc::now();
        let events = vec![
            event(1, "ok-1", EventLogEntryType::TaskCreated, now),
            event(2, "ok-1", EventLogEntryType::TaskHeartbeat, now),
            event(3, "ok-1", EventLogEntryType::TaskComplete, now),
            event(4, "live", EventLogEntryType::TaskCreated, now),
            event(5, "live", EventLogEntryType::TaskHeartbeat, now),
        ];
        let (kept, stats) = compact(events, now, Duration::from_secs(3600), FlushCursor::Ignore);
        assert_eq!(kept.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4]);
        assert_eq!(stats.dropped_heartbeats, 2);
        assert_eq!(stats.dropped_completed, 2);
    }

    #[test]
    fn failed_tasks_expire_after_retention() {
        let now = Utc::now();
        let old = now - chrono::Duration::hours(25);
        let events = vec![
            event(1, "bad-old", EventLogEntryType::TaskCreated, old),
            event(2, "bad-old", EventLogEntryType::TaskComplete, old),
            event(3, "bad-new", EventLogEntryType::TaskCreated, now),
            event(4, "bad-new", EventLogEntryType::TaskComplete, now),
        ];
        let (kept, stats) = compact(events, now, Duration::from_secs(24 * 3600), FlushCursor::Ignore);
        assert_eq!(kept.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(stats.dropped_expired, 2);
    }

    #[test]
    fn unflushed_entries_survive() {
        let now = Utc::now();
        let events = vec![
            event(1, "ok-1", EventLogEntryType::TaskCreated, now),
            event(2, "ok-1", EventLogEntryType::TaskComplete, now),
            event(3, "ok-2", EventLogEntryType::TaskCreated, now),
            event(4, "ok-2", EventLogEntryType::TaskHeartbeat, now),
            event(5, "ok-2", EventLogEntryType::TaskComplete, now),
        ];
        let (kept, stats) = compact(events, now, Duration::from_secs(60), FlushCursor::At(2));
        assert_eq!(kept.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(stats.dropped_heartbeats, 0);
    }

    #[test]
    fn flushed_heartbeats_are_dropped_unflushed_ones_kept() {
        let now = Utc::now();
        let events = vec![
            event(1, "live", EventLogEntryType::TaskCreated, now),
            event(2, "live", EventLogEntryType::TaskHeartbeat, now),
            event(3, "live", EventLogEntryType::TaskHeartbeat, now),
        ];
        let (kept, stats) = compact(events, now, Duration::from_secs(60), FlushCursor::At(2));
        assert_eq!(kept.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(stats.dropped_heartbeats, 1);
    }
}
