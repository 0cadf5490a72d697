//! The flush worker: tails the WAL and applies it to the repository.
//!
//! The worker only reads the log. Its progress lives in its own
//! `<path>.flush-checkpoint` file, advanced after each batch commits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::circuit::CircuitBreaker;
use super::protocol::{self, WorkerCommand, WorkerMessage};
use crate::error::Result;
use crate::storage::TaskRepository;
use crate::telemetry::{NoopHooks, TelemetryHooks, metrics};
use crate::wal::{EventLogEvent, EventLogReader};

#[derive(Debug, Clone)]
pub struct FlushWorkerConfig {
    pub wal_path: PathBuf,
    pub flush_interval: Duration,
    pub max_batch_size: usize,
    /// Extra attempts per batch after the first.
    pub max_retries: u32,
    /// Backoff base; doubles per retry.
    pub retry_base_delay: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset: Duration,
    /// Budget for draining on shutdown.
    pub shutdown_timeout: Duration,
}

impl FlushWorkerConfig {
    pub fn new(wal_path: impl Into<PathBuf>) -> Self {
        Self {
            wal_path: wal_path.into(),
            flush_interval: Duration::from_secs(1),
            max_batch_size: 1000,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            circuit_breaker_threshold: 5,
            circuit_breaker_reset: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushWorkerStats {
    pub flush_count: u64,
    pub entries_flushed: u64,
    pub failed_flushes: u64,
    pub consecutive_failures: u32,
    pub retries: u64,
    pub last_checkpoint: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub circuit_open: bool,
}

pub struct FlushWorker {
    config: FlushWorkerConfig,
    reader: EventLogReader,
    repository: Arc<dyn TaskRepository>,
    hooks: Arc<dyn TelemetryHooks>,
    breaker: CircuitBreaker,
    checkpoint: u64,
    stats: FlushWorkerStats,
    stats_tx: watch::Sender<FlushWorkerStats>,
}

impl FlushWorker {
    /// Opens the WAL for reading and resumes from the flush checkpoint.
    pub async fn new(config: FlushWorkerConfig, repository: Arc<dyn TaskRepository>) -> Result<Self> {
        let reader = EventLogReader::new(&config.wal_path)?;
        let checkpoint = reader.read_flush_checkpoint().await?.unwrap_or(0);
        let stats = FlushWorkerStats {
            last_checkpoint: checkpoint,
            ..FlushWorkerStats::default()
        };
        let (stats_tx, _) = watch::channel(stats.clone());
        info!(
            wal = %config.wal_path.display(),
            checkpoint,
            "flush worker started"
        );
        Ok(Self {
            breaker: CircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_reset,
            ),
            config,
            reader,
            repository,
            hooks: Arc::new(NoopHooks),
            checkpoint,
            stats,
            stats_tx,
        })
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn TelemetryHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &FlushWorkerConfig {
        &self.config
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint
    }

    pub fn stats(&self) -> FlushWorkerStats {
        let mut stats = self.stats.clone();
        stats.circuit_open = self.breaker.is_tripped();
        stats.consecutive_failures = self.breaker.consecutive_failures();
        stats
    }

    /// Follows the stats after every flush attempt.
    pub fn subscribe_stats(&self) -> watch::Receiver<FlushWorkerStats> {
        self.stats_tx.subscribe()
    }

    fn publish(&self) {
        self.stats_tx.send_replace(self.stats());
    }

    /// Applies at most one batch. Returns how many entries were flushed;
    /// zero when caught up or while the breaker is open.
    pub async fn flush_once(&mut self) -> Result<usize> {
        if self.breaker.is_open() {
            debug!("circuit open, skipping flush");
            self.publish();
            return Ok(0);
        }

        let mut entries = self.reader.read_entries_from_checkpoint(self.checkpoint).await?;
        if entries.is_empty() {
            return Ok(0);
        }
        entries.truncate(self.config.max_batch_size.max(1));
        let last_seq = entries.last().map(|e| e.seq).unwrap_or(self.checkpoint);

        if let Err(e) = self.apply_with_retry(&entries).await {
            self.stats.failed_flushes += 1;
            self.hooks.counter(metrics::FLUSH_FAILURES, 1, &[]);
            if self.breaker.record_failure() {
                error!(
                    failures = self.breaker.consecutive_failures(),
                    reset_after = ?self.config.circuit_breaker_reset,
                    "flush circuit opened"
                );
            }
            self.publish();
            return Err(e);
        }

        self.reader.write_flush_checkpoint(last_seq).await?;
        self.checkpoint = last_seq;
        self.breaker.record_success();
        self.stats.flush_count += 1;
        self.stats.entries_flushed += entries.len() as u64;
        self.stats.last_checkpoint = last_seq;
        self.stats.last_flush_at = Some(Utc::now());
        self.hooks.counter(
            metrics::FLUSH_ENTRIES,
            entries.len() as u64,
            &[KeyValue::new("worker", "flush")],
        );
        self.publish();
        debug!(entries = entries.len(), checkpoint = last_seq, "batch flushed");
        Ok(entries.len())
    }

    async fn apply_with_retry(&mut self, batch: &[EventLogEvent]) -> Result<()> {
        let mut retries = 0u32;
        loop {
            match self.repository.execute_batch(batch).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && retries < self.config.max_retries => {
                    retries += 1;
                    self.stats.retries += 1;
                    let delay = self
                        .config
                        .retry_base_delay
                        .saturating_mul(1u32 << (retries - 1).min(16));
                    warn!(retry = retries, ?delay, error = %e, "flush batch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Flushes until caught up, an error, or the timeout.
    pub async fn drain(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, self.flush_once()).await {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
        }
        warn!(checkpoint = self.checkpoint, "drain timed out with entries left");
        Ok(())
    }

    /// Drains, then closes the repository.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        let drained = self.drain(timeout).await;
        if let Err(e) = &drained {
            warn!(error = %e, "final drain failed");
        }
        self.repository.close().await?;
        info!(checkpoint = self.checkpoint, "flush worker stopped");
        drained
    }

    async fn tick(&mut self) {
        if let Err(e) = self.flush_once().await {
            warn!(error = %e, "flush failed");
        }
    }

    /// In-process loop: flush on the interval until cancelled, then drain.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<FlushWorkerStats> {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        let timeout = self.config.shutdown_timeout;
        self.shutdown(timeout).await?;
        Ok(self.stats())
    }

    /// Subprocess loop: commands arrive on `input`, messages leave on
    /// `output`. A closed `input` means the manager is gone: drain and
    /// exit.
    pub async fn run_ipc<R, W>(mut self, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut commands = FramedRead::new(input, protocol::codec());
        let mut messages = FramedWrite::new(output, protocol::codec());
        protocol::send(&mut messages, &WorkerMessage::Ready).await?;

        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                frame = commands.next() => match frame {
                    None => {
                        info!("command channel closed, draining");
                        let timeout = self.config.shutdown_timeout;
                        return self.shutdown(timeout).await;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "command channel broken, draining");
                        let timeout = self.config.shutdown_timeout;
                        return self.shutdown(timeout).await;
                    }
                    Some(Ok(frame)) => match protocol::decode::<WorkerCommand>(&frame) {
                        Ok(WorkerCommand::GetStats) => {
                            let stats = self.stats();
                            protocol::send(&mut messages, &WorkerMessage::Stats(stats)).await?;
                        }
                        Ok(WorkerCommand::Shutdown { timeout_ms }) => {
                            let result = self.shutdown(Duration::from_millis(timeout_ms)).await;
                            let reply = match &result {
                                Ok(()) => WorkerMessage::ShutdownComplete,
                                Err(e) => WorkerMessage::Error(e.to_string()),
                            };
                            protocol::send(&mut messages, &reply).await?;
                            return result;
                        }
                        Err(e) => {
                            warn!(error = %e, "ignoring malformed command");
                            protocol::send(&mut messages, &WorkerMessage::Error(e.to_string())).await?;
                        }
                    },
                },
            }
        }
    }
}
