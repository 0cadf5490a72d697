//! Write-ahead log.
//!
//! An append-only NDJSON file of sequenced, checksummed [`EventLogEvent`]s.
//! Companion files sit next to the log:
//!
//! - `<path>.checkpoint`: last seq known to be on disk (plain integer);
//! - `<path>.1`, `<path>.2`, ...: rotated generations, newest first;
//! - `<path>.flush-checkpoint`: the flush worker's cursor.
//!
//! [`EventLog`] is the single writer. [`EventLogReader`] is the read-only
//! handle the flush worker and the `taskd wal` commands use.

pub mod compaction;
pub mod entry;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub use compaction::{CompactionStats, FlushCursor};
pub use entry::{EventLogEntry, EventLogEntryType, EventLogEvent};

#[derive(Debug, Clone)]
pub struct EventLogConfig {
    pub path: PathBuf,
    /// Rotate once the active file reaches this size.
    pub max_file_size: u64,
    /// Rotate once the active file is this old.
    pub max_file_age: Duration,
    /// How often the background timer checks size and age.
    pub rotation_check_interval: Duration,
    /// Rotated generations kept on disk.
    pub retention: usize,
    /// Rewrite the checkpoint every this many appends.
    pub checkpoint_every: u64,
    /// Failed and cancelled tasks are compacted away after this long.
    pub terminal_retention: Duration,
    /// Never compact entries the flush worker has not reached.
    pub respect_flush_checkpoint: bool,
}

impl EventLogConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("taskwal.log"),
            max_file_size: 10 * 1024 * 1024,
            max_file_age: Duration::from_secs(24 * 3600),
            rotation_check_interval: Duration::from_secs(60),
            retention: 5,
            checkpoint_every: 100,
            terminal_retention: Duration::from_secs(24 * 3600),
            respect_flush_checkpoint: true,
        }
    }
}

/// Rejects empty paths and any `..` component.
pub fn validate_log_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidPath("event log path is empty".to_string()));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::InvalidPath(format!(
            "event log path {} contains '..'",
            path.display()
        )));
    }
    if path.file_name().is_none() {
        return Err(Error::InvalidPath(format!(
            "event log path {} has no file name",
            path.display()
        )));
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Writes `contents` to a sibling temp file and renames it over `path`.
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = with_suffix(path, ".tmp");
    {
        let mut file = File::create(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
    }
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_seq_file(path: &Path) -> Result<Option<u64>> {
    match fs::read_to_string(path).await {
        Ok(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse::<u64>().map(Some).map_err(|e| {
                Error::persistence(
                    "read_checkpoint",
                    format!("{}: {e}", path.display()),
                    false,
                )
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Contents of one log file.
#[derive(Debug, Default)]
pub struct LogFile {
    pub events: Vec<EventLogEvent>,
    /// Lines that failed to parse or verify.
    pub malformed: usize,
}

impl LogFile {
    pub fn first_seq(&self) -> Option<u64> {
        self.events.first().map(|e| e.seq)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.events.last().map(|e| e.seq)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Read-only access to a log and its generations.
#[derive(Debug)]
pub struct EventLogReader {
    path: PathBuf,
    malformed: AtomicU64,
}

impl EventLogReader {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        validate_log_path(&path)?;
        Ok(Self {
            path,
            malformed: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        with_suffix(&self.path, ".checkpoint")
    }

    pub fn flush_checkpoint_path(&self) -> PathBuf {
        with_suffix(&self.path, ".flush-checkpoint")
    }

    /// Path of rotated generation `n` (1 is the newest).
    pub fn generation_path(&self, n: usize) -> PathBuf {
        with_suffix(&self.path, &format!(".{n}"))
    }

    /// Malformed lines skipped by this handle so far.
    pub fn malformed_skipped(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub async fn read_checkpoint(&self) -> Result<Option<u64>> {
        read_seq_file(&self.checkpoint_path()).await
    }

    pub async fn read_flush_checkpoint(&self) -> Result<Option<u64>> {
        read_seq_file(&self.flush_checkpoint_path()).await
    }

    /// Atomically advances the flush worker's cursor.
    pub async fn write_flush_checkpoint(&self, seq: u64) -> Result<()> {
        write_atomic(&self.flush_checkpoint_path(), &seq.to_string()).await
    }

    /// Existing rotated generations, newest first.
    pub async fn generations(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut n = 1;
        loop {
            let path = self.generation_path(n);
            if !fs::try_exists(&path).await? {
                break;
            }
            out.push(path);
            n += 1;
        }
        Ok(out)
    }

    /// Reads one file. A missing file is empty; bad lines are skipped.
    pub async fn read_file(&self, path: &Path) -> Result<LogFile> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogFile::default()),
            Err(e) => return Err(e.into()),
        };

        let mut file = LogFile::default();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match EventLogEvent::parse_line(line) {
                Ok(event) => file.events.push(event),
                Err(e) => {
                    file.malformed += 1;
                    warn!(
                        path = %path.display(),
                        line = lineno + 1,
                        error = %e,
                        "skipping malformed event log line"
                    );
                }
            }
        }
        self.malformed
            .fetch_add(file.malformed as u64, Ordering::Relaxed);
        Ok(file)
    }

    /// Every entry across all generations and the active file, in seq order.
    pub async fn read_all(&self) -> Result<Vec<EventLogEvent>> {
        let mut events = Vec::new();
        for path in self.generations().await?.iter().rev() {
            events.extend(self.read_file(path).await?.events);
        }
        events.extend(self.read_file(&self.path).await?.events);
        events.sort_by_key(|e| e.seq);
        events.dedup_by_key(|e| e.seq);
        Ok(events)
    }

    /// Entries with `seq > checkpoint`, in seq order.
    ///
    /// Walks from the active file back through generations and stops at the
    /// first file that already reaches the checkpoint.
    pub async fn read_entries_from_checkpoint(&self, checkpoint: u64) -> Result<Vec<EventLogEvent>> {
        let mut events = Vec::new();
        let active = self.read_file(&self.path).await?;
        let mut covered = active.first_seq().is_some_and(|s| s <= checkpoint + 1);
        events.extend(active.events.into_iter().filter(|e| e.seq > checkpoint));

        if !covered {
            for path in self.generations().await? {
                let file = self.read_file(&path).await?;
                covered = file.first_seq().is_some_and(|s| s <= checkpoint + 1);
                events.extend(file.events.into_iter().filter(|e| e.seq > checkpoint));
                if covered {
                    break;
                }
            }
        }

        events.sort_by_key(|e| e.seq);
        events.dedup_by_key(|e| e.seq);
        Ok(events)
    }

    /// Highest seq found in the checkpoint, the active file, or generation 1.
    pub async fn last_known_seq(&self) -> Result<u64> {
        let checkpoint = self.read_checkpoint().await?.unwrap_or(0);
        let active = self.read_file(&self.path).await?.last_seq().unwrap_or(0);
        let previous = self
            .read_file(&self.generation_path(1))
            .await?
            .last_seq()
            .unwrap_or(0);
        Ok(checkpoint.max(active).max(previous))
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLogStats {
    pub current_seq: u64,
    pub entries_written: u64,
    pub malformed_skipped: u64,
    pub rotations: u64,
    pub active_file_size: u64,
}

struct WriterState {
    file: Option<File>,
    seq: u64,
    since_checkpoint: u64,
    size: u64,
    opened_at: SystemTime,
}

/// The single-writer handle.
///
/// Appends and rotation share one async lock, so an append issued during a
/// rotation waits for the new file instead of racing the old handle.
pub struct EventLog {
    config: EventLogConfig,
    reader: EventLogReader,
    state: Mutex<WriterState>,
    entries_written: AtomicU64,
    rotations: AtomicU64,
    cancel: CancellationToken,
    rotation_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}

async fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

impl EventLog {
    /// Opens (or creates) the log and resumes its sequence.
    pub async fn open(config: EventLogConfig) -> Result<Self> {
        let reader = EventLogReader::new(&config.path)?;
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let seq = reader.last_known_seq().await?;
        let file = open_append(&config.path).await?;
        let meta = file.metadata().await?;
        let opened_at = meta
            .created()
            .or_else(|_| meta.modified())
            .unwrap_or_else(|_| SystemTime::now());

        info!(path = %config.path.display(), seq, "event log opened");

        Ok(Self {
            reader,
            state: Mutex::new(WriterState {
                file: Some(file),
                seq,
                since_checkpoint: 0,
                size: meta.len(),
                opened_at,
            }),
            config,
            entries_written: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            rotation_task: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EventLogConfig {
        &self.config
    }

    pub fn reader(&self) -> &EventLogReader {
        &self.reader
    }

    /// Starts the background size/age check.
    pub fn spawn_rotation(self: &Arc<Self>) {
        let log = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.config.rotation_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = log.rotate_if_needed().await {
                            warn!(error = %e, "event log rotation failed");
                        }
                    }
                }
            }
        });
        if let Ok(mut slot) = self.rotation_task.lock() {
            *slot = Some(handle);
        }
    }

    /// Appends one entry and returns its seq.
    ///
    /// `fsync` defaults to the entry type's criticality. The seq is only
    /// consumed when the write succeeds.
    pub async fn append_entry(&self, entry: &EventLogEntry, fsync: Option<bool>) -> Result<u64> {
        let fsync = fsync.unwrap_or_else(|| entry.entry_type.is_critical());
        let mut state = self.state.lock().await;

        let seq = state.seq + 1;
        let event = EventLogEvent::seal(entry.clone(), seq)?;
        let mut line = event.to_line()?;
        line.push('\n');

        let file = state
            .file
            .as_mut()
            .ok_or_else(|| Error::persistence("append", "event log is closed", false))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        if fsync {
            file.sync_data().await?;
        }

        state.seq = seq;
        state.size += line.len() as u64;
        state.since_checkpoint += 1;
        self.entries_written.fetch_add(1, Ordering::Relaxed);

        if fsync || state.since_checkpoint >= self.config.checkpoint_every {
            write_atomic(&self.reader.checkpoint_path(), &seq.to_string()).await?;
            state.since_checkpoint = 0;
        }

        debug!(
            seq,
            entry_type = %entry.entry_type,
            task_id = %entry.task_id,
            "event log append"
        );
        Ok(seq)
    }

    pub async fn current_seq(&self) -> u64 {
        self.state.lock().await.seq
    }

    pub async fn read_entries_from_checkpoint(&self, checkpoint: u64) -> Result<Vec<EventLogEvent>> {
        self.reader.read_entries_from_checkpoint(checkpoint).await
    }

    pub async fn read_all(&self) -> Result<Vec<EventLogEvent>> {
        self.reader.read_all().await
    }

    /// Rotates when the active file is over the size or age threshold.
    pub async fn rotate_if_needed(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.size == 0 {
            return Ok(false);
        }
        let age = SystemTime::now()
            .duration_since(state.opened_at)
            .unwrap_or_default();
        if state.size < self.config.max_file_size && age < self.config.max_file_age {
            return Ok(false);
        }
        self.rotate_locked(&mut state).await?;
        Ok(true)
    }

    /// Rotates unconditionally (no-op on an empty active file).
    pub async fn rotate(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.size == 0 {
            return Ok(());
        }
        self.rotate_locked(&mut state).await
    }

    async fn rotate_locked(&self, state: &mut WriterState) -> Result<()> {
        let Some(mut file) = state.file.take() else {
            return Err(Error::persistence("rotate", "event log is closed", false));
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let retention = self.config.retention.max(1);
        let oldest = self.reader.generation_path(retention);
        if fs::try_exists(&oldest).await? {
            fs::remove_file(&oldest).await?;
            info!(path = %oldest.display(), "deleted oldest event log generation");
        }
        for n in (1..retention).rev() {
            let from = self.reader.generation_path(n);
            if fs::try_exists(&from).await? {
                fs::rename(&from, self.reader.generation_path(n + 1)).await?;
            }
        }
        let rotated = self.reader.generation_path(1);
        fs::rename(&self.config.path, &rotated).await?;

        // Reopen before compacting: a compaction error must leave the log writable.
        state.file = Some(open_append(&self.config.path).await?);
        state.size = 0;
        state.opened_at = SystemTime::now();
        self.rotations.fetch_add(1, Ordering::Relaxed);

        write_atomic(&self.reader.checkpoint_path(), &state.seq.to_string()).await?;
        state.since_checkpoint = 0;

        let stats = match self.compact_generation(&rotated).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(path = %rotated.display(), error = %e, "compaction failed, generation kept as-is");
                return Ok(());
            }
        };
        info!(
            seq = state.seq,
            kept = stats.kept,
            dropped = stats.dropped(),
            "event log rotated"
        );
        Ok(())
    }

    async fn compact_generation(&self, path: &Path) -> Result<CompactionStats> {
        let cursor = if self.config.respect_flush_checkpoint {
            FlushCursor::At(self.reader.read_flush_checkpoint().await?.unwrap_or(0))
        } else {
            FlushCursor::Ignore
        };
        let file = self.reader.read_file(path).await?;
        let (kept, stats) = compaction::compact(
            file.events,
            Utc::now(),
            self.config.terminal_retention,
            cursor,
        );
        let mut contents = String::new();
        for event in &kept {
            contents.push_str(&event.to_line()?);
            contents.push('\n');
        }
        write_atomic(path, &contents).await?;
        Ok(stats)
    }

    pub async fn stats(&self) -> EventLogStats {
        let state = self.state.lock().await;
        EventLogStats {
            current_seq: state.seq,
            entries_written: self.entries_written.load(Ordering::Relaxed),
            malformed_skipped: self.reader.malformed_skipped(),
            rotations: self.rotations.load(Ordering::Relaxed),
            active_file_size: state.size,
        }
    }

    /// Stops the rotation timer, syncs and closes the file, and writes a
    /// final checkpoint. Further appends fail.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let handle = self.rotation_task.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let mut state = self.state.lock().await;
        if let Some(mut file) = state.file.take() {
            file.flush().await?;
            file.sync_all().await?;
            write_atomic(&self.reader.checkpoint_path(), &state.seq.to_string()).await?;
            info!(seq = state.seq, "event log closed");
        }
        Ok(())
    }
}
