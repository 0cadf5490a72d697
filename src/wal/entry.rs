//! WAL record types and the line codec.
//!
//! One record per line: the [`EventLogEntry`] fields, a `seq`, and a
//! `checksum`. The checksum is SHA-256 over the compact JSON of the record
//! with keys sorted and the `checksum` field itself removed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::{IdempotencyKey, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventLogEntryType {
    TaskCreated,
    TaskStart,
    TaskProgress,
    TaskComplete,
    TaskError,
    TaskCancelled,
    TaskHeartbeat,
    TaskCustom,
}

impl EventLogEntryType {
    /// Critical records are fsynced before `append_entry` returns.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            EventLogEntryType::TaskCreated
                | EventLogEntryType::TaskStart
                | EventLogEntryType::TaskComplete
                | EventLogEntryType::TaskCancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventLogEntryType::TaskCreated => "TASK_CREATED",
            EventLogEntryType::TaskStart => "TASK_START",
            EventLogEntryType::TaskProgress => "TASK_PROGRESS",
            EventLogEntryType::TaskComplete => "TASK_COMPLETE",
            EventLogEntryType::TaskError => "TASK_ERROR",
            EventLogEntryType::TaskCancelled => "TASK_CANCELLED",
            EventLogEntryType::TaskHeartbeat => "TASK_HEARTBEAT",
            EventLogEntryType::TaskCustom => "TASK_CUSTOM",
        }
    }
}

impl std::fmt::Display for EventLogEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventLogEntryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| Error::Validation(format!("unknown event log entry type: {s}")))
    }
}

/// A WAL record before sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    #[serde(rename = "type")]
    pub entry_type: EventLogEntryType,
    pub task_id: TaskId,
    pub idempotency_key: IdempotencyKey,
    /// Id of the task event this record was produced from.
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    /// Type-specific fields.
    pub payload: Value,
}

/// A sequenced, checksummed WAL record as it sits on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEvent {
    #[serde(flatten)]
    pub entry: EventLogEntry,
    pub seq: u64,
    pub checksum: String,
}

/// Checksum of a record object. Any `checksum` key is ignored.
pub fn compute_checksum(record: &Value) -> String {
    let digest = match record {
        Value::Object(map) if map.contains_key("checksum") => {
            let mut map = map.clone();
            map.remove("checksum");
            Sha256::digest(Value::Object(map).to_string().as_bytes())
        }
        other => Sha256::digest(other.to_string().as_bytes()),
    };
    hex::encode(digest)
}

impl EventLogEvent {
    /// Assigns `seq` and computes the checksum.
    pub fn seal(entry: EventLogEntry, seq: u64) -> Result<Self> {
        let mut record = serde_json::to_value(&entry)?;
        if let Some(obj) = record.as_object_mut() {
            obj.insert("seq".to_string(), Value::from(seq));
        }
        let checksum = compute_checksum(&record);
        Ok(Self {
            entry,
            seq,
            checksum,
        })
    }

    /// One line of NDJSON, without the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a line and verifies its checksum.
    pub fn parse_line(line: &str) -> Result<Self> {
        let record: Value = serde_json::from_str(line)?;
        let stored = record
            .get("checksum")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("record has no checksum".to_string()))?
            .to_string();
        let expected = compute_checksum(&record);
        if stored != expected {
            return Err(Error::Validation(format!(
                "checksum mismatch: stored {stored}, computed {expected}"
            )));
        }
        Ok(serde_json::from_value(record)?)
    }

    /// Recomputes the checksum from the record's current fields.
    pub fn verify(&self) -> bool {
        match serde_json::to_value(self) {
            Ok(record) => compute_checksum(&record) == self.checksum,
            Err(_) => false,
        }
    }

    pub fn entry_type(&self) -> EventLogEntryType {
        self.entry.entry_type
    }
}
