//! Supervises the flush worker.
//!
//! In [`FlushMode::Subprocess`] the worker is a child process (`taskd
//! flush-worker`) so a stalled or crashing database driver cannot take task
//! execution down with it. [`FlushMode::InProcess`] runs the same worker on
//! a tokio task.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{self, WorkerCommand, WorkerMessage};
use super::worker::{FlushWorker, FlushWorkerConfig, FlushWorkerStats};
use crate::error::{Error, Result};
use crate::guard::lock;
use crate::storage::TaskRepository;

#[derive(Clone)]
pub enum FlushMode {
    Subprocess {
        program: PathBuf,
        /// Arguments before the worker flags, e.g. `["flush-worker"]`.
        args: Vec<String>,
        /// Handed to the child as `DATABASE_URL`.
        database_url: SecretString,
    },
    InProcess {
        repository: Arc<dyn TaskRepository>,
    },
}

impl fmt::Debug for FlushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushMode::Subprocess { program, args, .. } => f
                .debug_struct("Subprocess")
                .field("program", program)
                .field("args", args)
                .finish_non_exhaustive(),
            FlushMode::InProcess { .. } => f.write_str("InProcess"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlushManagerConfig {
    pub mode: FlushMode,
    pub health_check_interval: Duration,
    /// Restarts allowed before the manager gives up.
    pub max_restarts: u32,
    pub restart_delay: Duration,
    /// How long a new subprocess has to report `ready`.
    pub ready_timeout: Duration,
    pub worker: FlushWorkerConfig,
}

impl FlushManagerConfig {
    pub fn new(mode: FlushMode, worker: FlushWorkerConfig) -> Self {
        Self {
            mode,
            health_check_interval: Duration::from_secs(5),
            max_restarts: 5,
            restart_delay: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(10),
            worker,
        }
    }

    pub fn in_process(worker: FlushWorkerConfig, repository: Arc<dyn TaskRepository>) -> Self {
        Self::new(FlushMode::InProcess { repository }, worker)
    }

    pub fn subprocess(
        worker: FlushWorkerConfig,
        program: impl Into<PathBuf>,
        database_url: SecretString,
    ) -> Self {
        Self::new(
            FlushMode::Subprocess {
                program: program.into(),
                args: vec!["flush-worker".to_string()],
                database_url,
            },
            worker,
        )
    }
}

struct WorkerProcess {
    child: Child,
    commands: FramedWrite<ChildStdin, LengthDelimitedCodec>,
    messages: FramedRead<ChildStdout, LengthDelimitedCodec>,
}

/// `taskd flush-worker` flags carrying every worker setting.
fn worker_args(worker: &FlushWorkerConfig) -> Vec<OsString> {
    let ms = |d: Duration| d.as_millis().to_string();
    vec![
        "--wal".into(),
        worker.wal_path.clone().into_os_string(),
        "--interval-ms".into(),
        ms(worker.flush_interval).into(),
        "--batch-size".into(),
        worker.max_batch_size.to_string().into(),
        "--max-retries".into(),
        worker.max_retries.to_string().into(),
        "--breaker-threshold".into(),
        worker.circuit_breaker_threshold.to_string().into(),
        "--breaker-reset-ms".into(),
        ms(worker.circuit_breaker_reset).into(),
        "--retry-base-ms".into(),
        ms(worker.retry_base_delay).into(),
        "--shutdown-timeout-ms".into(),
        ms(worker.shutdown_timeout).into(),
    ]
}

impl WorkerProcess {
    async fn spawn(config: &FlushManagerConfig) -> Result<Self> {
        let FlushMode::Subprocess {
            program,
            args,
            database_url,
        } = &config.mode
        else {
            return Err(Error::Config("flush mode is not subprocess".to_string()));
        };
        let mut child = Command::new(program)
            .args(args)
            .args(worker_args(&config.worker))
            .env("DATABASE_URL", database_url.expose_secret())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("worker stdout not captured".to_string()))?;
        let mut process = Self {
            child,
            commands: FramedWrite::new(stdin, protocol::codec()),
            messages: FramedRead::new(stdout, protocol::codec()),
        };

        match tokio::time::timeout(config.ready_timeout, process.recv()).await {
            Ok(Ok(WorkerMessage::Ready)) => {
                info!(pid = process.child.id(), "flush worker ready");
                Ok(process)
            }
            Ok(Ok(other)) => Err(Error::Ipc(format!("expected ready, got {other:?}"))),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let _ = process.child.start_kill();
                Err(Error::Ipc(format!(
                    "flush worker not ready within {:?}",
                    config.ready_timeout
                )))
            }
        }
    }

    async fn recv(&mut self) -> Result<WorkerMessage> {
        match self.messages.next().await {
            Some(Ok(frame)) => protocol::decode(&frame),
            Some(Err(e)) => Err(Error::Ipc(format!("read failed: {e}"))),
            None => Err(Error::Ipc("flush worker closed its output".to_string())),
        }
    }

    /// Sends a command and waits for the first reply it accepts.
    async fn request<T>(
        &mut self,
        command: &WorkerCommand,
        timeout: Duration,
        mut accept: impl FnMut(WorkerMessage) -> Option<Result<T>>,
    ) -> Result<T> {
        protocol::send(&mut self.commands, command).await?;
        let wait = async {
            loop {
                let message = self.recv().await?;
                match accept(message) {
                    Some(result) => return result,
                    None => continue,
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Ipc(format!("no reply to {command:?} within {timeout:?}")))?
    }

    /// `try_wait` is the liveness probe.
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

struct InProcessWorker {
    cancel: CancellationToken,
    handle: JoinHandle<Result<FlushWorkerStats>>,
    stats: watch::Receiver<FlushWorkerStats>,
}

impl InProcessWorker {
    async fn spawn(config: &FlushManagerConfig) -> Result<Self> {
        let FlushMode::InProcess { repository } = &config.mode else {
            return Err(Error::Config("flush mode is not in-process".to_string()));
        };
        let worker = FlushWorker::new(config.worker.clone(), Arc::clone(repository)).await?;
        let stats = worker.subscribe_stats();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        Ok(Self {
            cancel,
            handle,
            stats,
        })
    }
}

enum Worker {
    Process(WorkerProcess),
    Task(InProcessWorker),
}

impl Worker {
    async fn spawn(config: &FlushManagerConfig) -> Result<Self> {
        match config.mode {
            FlushMode::Subprocess { .. } => Ok(Worker::Process(WorkerProcess::spawn(config).await?)),
            FlushMode::InProcess { .. } => Ok(Worker::Task(InProcessWorker::spawn(config).await?)),
        }
    }

    fn is_alive(&mut self) -> bool {
        match self {
            Worker::Process(p) => p.is_alive(),
            Worker::Task(t) => !t.handle.is_finished(),
        }
    }
}

struct Inner {
    config: FlushManagerConfig,
    worker: Mutex<Option<Worker>>,
    restarts: AtomicU32,
    gave_up: AtomicBool,
    cancel: CancellationToken,
}

pub struct FlushManager {
    inner: Arc<Inner>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FlushManager {
    /// Starts the worker and its supervisor. Fails if the first worker
    /// cannot be started.
    pub async fn start(config: FlushManagerConfig) -> Result<Self> {
        let worker = Worker::spawn(&config).await?;
        let inner = Arc::new(Inner {
            config,
            worker: Mutex::new(Some(worker)),
            restarts: AtomicU32::new(0),
            gave_up: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        let supervisor = tokio::spawn(supervise(Arc::clone(&inner)));
        info!(mode = ?inner.config.mode, "flush manager started");
        Ok(Self {
            inner,
            supervisor: std::sync::Mutex::new(Some(supervisor)),
        })
    }

    pub fn restarts(&self) -> u32 {
        self.inner.restarts.load(Ordering::Acquire)
    }

    /// True once the restart budget is spent.
    pub fn gave_up(&self) -> bool {
        self.inner.gave_up.load(Ordering::Acquire)
    }

    pub async fn is_alive(&self) -> bool {
        match self.inner.worker.lock().await.as_mut() {
            Some(worker) => worker.is_alive(),
            None => false,
        }
    }

    /// Current worker statistics.
    pub async fn stats(&self) -> Result<FlushWorkerStats> {
        let mut guard = self.inner.worker.lock().await;
        match guard.as_mut() {
            Some(Worker::Task(t)) => Ok(t.stats.borrow().clone()),
            Some(Worker::Process(p)) => {
                p.request(
                    &WorkerCommand::GetStats,
                    self.inner.config.ready_timeout,
                    |message| match message {
                        WorkerMessage::Stats(stats) => Some(Ok(stats)),
                        WorkerMessage::Error(e) => Some(Err(Error::Ipc(e))),
                        _ => None,
                    },
                )
                .await
            }
            None => Err(Error::Ipc("flush worker is not running".to_string())),
        }
    }

    /// Stops supervision and lets the worker drain before it exits.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.cancel.cancel();
        let supervisor = lock(&self.supervisor).take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        let Some(worker) = self.inner.worker.lock().await.take() else {
            return Ok(());
        };
        let drain = self.inner.config.worker.shutdown_timeout;
        match worker {
            Worker::Task(t) => {
                t.cancel.cancel();
                match tokio::time::timeout(drain + Duration::from_secs(5), t.handle).await {
                    Ok(Ok(Ok(stats))) => {
                        info!(entries = stats.entries_flushed, "flush worker drained");
                        Ok(())
                    }
                    Ok(Ok(Err(e))) => Err(e),
                    Ok(Err(e)) => Err(Error::Other(format!("flush worker task failed: {e}"))),
                    Err(_) => Err(Error::Ipc("flush worker did not stop in time".to_string())),
                }
            }
            Worker::Process(mut p) => {
                let command = WorkerCommand::Shutdown {
                    timeout_ms: drain.as_millis() as u64,
                };
                let reply = p
                    .request(&command, drain + Duration::from_secs(5), |message| match message {
                        WorkerMessage::ShutdownComplete => Some(Ok(())),
                        WorkerMessage::Error(e) => Some(Err(Error::Ipc(e))),
                        _ => None,
                    })
                    .await;
                if let Err(e) = &reply {
                    warn!(error = %e, "flush worker shutdown was not clean");
                }
                match tokio::time::timeout(Duration::from_secs(5), p.child.wait()).await {
                    Ok(Ok(status)) => debug!(%status, "flush worker exited"),
                    _ => {
                        warn!("flush worker did not exit, killing it");
                        let _ = p.child.kill().await;
                    }
                }
                reply
            }
        }
    }
}

async fn supervise(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.health_check_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let alive = match inner.worker.lock().await.as_mut() {
            Some(worker) => worker.is_alive(),
            None => false,
        };
        if alive {
            continue;
        }

        let restarts = inner.restarts.load(Ordering::Acquire);
        if restarts >= inner.config.max_restarts {
            error!(restarts, "flush worker keeps dying, giving up");
            inner.gave_up.store(true, Ordering::Release);
            *inner.worker.lock().await = None;
            return;
        }

        warn!(attempt = restarts + 1, "flush worker died, restarting");
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.config.restart_delay) => {}
        }
        inner.restarts.fetch_add(1, Ordering::AcqRel);
        match Worker::spawn(&inner.config).await {
            Ok(worker) => *inner.worker.lock().await = Some(worker),
            Err(e) => {
                error!(error = %e, "flush worker restart failed");
                *inner.worker.lock().await = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryTaskRepository;

    #[test]
    fn worker_args_carry_every_setting() {
        let mut worker = FlushWorkerConfig::new("/tmp/events.log");
        worker.retry_base_delay = Duration::from_millis(7);
        worker.shutdown_timeout = Duration::from_millis(1500);
        let args: Vec<String> = worker_args(&worker)
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        let flag = |name: &str| {
            let at = args.iter().position(|a| a == name).unwrap();
            args[at + 1].clone()
        };
        assert_eq!(flag("--wal"), "/tmp/events.log");
        assert_eq!(flag("--retry-base-ms"), "7");
        assert_eq!(flag("--shutdown-timeout-ms"), "1500");
        assert_eq!(flag("--batch-size"), worker.max_batch_size.to_string());
    }

    #[tokio::test]
    async fn in_process_worker_reports_stats_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(InMemoryTaskRepository::new());
        let mut worker = FlushWorkerConfig::new(dir.path().join("events.log"));
        worker.flush_interval = Duration::from_millis(10);
        let manager = FlushManager::start(FlushManagerConfig::in_process(worker, repo))
            .await
            .unwrap();

        assert!(manager.is_alive().await);
        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.entries_flushed, 0);
        manager.shutdown().await.unwrap();
        assert!(!manager.is_alive().await);
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = FlushManagerConfig::subprocess(
            FlushWorkerConfig::new(dir.path().join("events.log")),
            dir.path().join("no-such-binary"),
            SecretString::from("sqlite::memory:"),
        );
        assert!(FlushManager::start(config).await.is_err());
    }
}
