//! Typed configuration.
//!
//! [`Config`] holds the process settings from environment variables, loaded
//! once at startup; it fails fast if required vars are missing. Sensitive
//! values are wrapped in `secrecy::SecretString` to prevent log leaks.
//!
//! [`EngineSettings`] is the optional TOML tuning file. Every knob is
//! optional and falls back to the component default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::engine::TaskSystemConfig;
use crate::error::{Error, Result};
use crate::flush::{FlushManagerConfig, FlushMode, FlushWorkerConfig};
use crate::wal::EventLogConfig;

#[derive(Debug)]
pub struct Config {
    pub wal_path: PathBuf,
    /// Repository the flush worker writes to.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Path of an [`EngineSettings`] file.
    pub settings_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            wal_path: PathBuf::from(required_var("TASKWAL_WAL_PATH")?),
            database_url: optional_var("DATABASE_URL").map(SecretString::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            settings_path: optional_var("TASKWAL_CONFIG").map(PathBuf::from),
        })
    }

    /// The tuning file named by `TASKWAL_CONFIG`, or all defaults.
    pub fn settings(&self) -> Result<EngineSettings> {
        match &self.settings_path {
            Some(path) => EngineSettings::load(path),
            None => Ok(EngineSettings::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    pub wal: WalSettings,
    pub backpressure: BackpressureSettings,
    pub slots: SlotSettings,
    pub dlq: DlqSettings,
    pub streams: StreamSettings,
    pub executor: ExecutorSettings,
    pub recovery: RecoverySettings,
    pub flush: FlushSettings,
    pub system: SystemSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WalSettings {
    pub max_file_size: Option<u64>,
    pub max_file_age_ms: Option<u64>,
    pub rotation_check_interval_ms: Option<u64>,
    pub retention: Option<usize>,
    pub checkpoint_every: Option<u64>,
    pub terminal_retention_ms: Option<u64>,
    pub respect_flush_checkpoint: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackpressureSettings {
    pub window_ms: Option<u64>,
    pub max_global_per_window: Option<usize>,
    pub max_user_per_window: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub queue_retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlotSettings {
    pub max_global: Option<usize>,
    pub max_per_user: Option<usize>,
    pub max_per_template: std::collections::HashMap<String, usize>,
    pub acquire_timeout_ms: Option<u64>,
    pub max_waiting: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DlqSettings {
    pub max_size: Option<usize>,
    pub ttl_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub cleanup_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSettings {
    pub buffer_capacity: Option<usize>,
    pub retention_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorSettings {
    pub heartbeat_interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoverySettings {
    pub interval_ms: Option<u64>,
    pub stale_threshold_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub wait_timeout_ms: Option<u64>,
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlushSettings {
    pub interval_ms: Option<u64>,
    pub max_batch_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub circuit_breaker_threshold: Option<u32>,
    pub circuit_breaker_reset_ms: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub max_restarts: Option<u32>,
    pub restart_delay_ms: Option<u64>,
    pub ready_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemSettings {
    pub scheduler_interval_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
}

macro_rules! apply {
    ($target:expr, $value:expr) => {
        if let Some(v) = $value {
            $target = v;
        }
    };
    ($target:expr, $value:expr, $map:expr) => {
        if let Some(v) = $value {
            $target = $map(v);
        }
    };
}

impl EngineSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if let Some(m) = self.executor.multiplier {
            if !m.is_finite() || m < 1.0 {
                return Err(Error::Config(format!(
                    "executor.multiplier must be >= 1.0, got {m}"
                )));
            }
        }
        if self.executor.max_attempts == Some(0) {
            return Err(Error::Config("executor.max_attempts must be at least 1".into()));
        }
        if self.streams.buffer_capacity == Some(0) {
            return Err(Error::Config("streams.buffer_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// A system config for the WAL at `wal_path`, without a flush manager.
    pub fn into_system_config(self, wal_path: impl Into<PathBuf>) -> TaskSystemConfig {
        let mut config = TaskSystemConfig::new(EventLogConfig::new(wal_path));

        let w = self.wal;
        apply!(config.wal.max_file_size, w.max_file_size);
        apply!(config.wal.max_file_age, w.max_file_age_ms, ms);
        apply!(config.wal.rotation_check_interval, w.rotation_check_interval_ms, ms);
        apply!(config.wal.retention, w.retention);
        apply!(config.wal.checkpoint_every, w.checkpoint_every);
        apply!(config.wal.terminal_retention, w.terminal_retention_ms, ms);
        apply!(config.wal.respect_flush_checkpoint, w.respect_flush_checkpoint);

        let b = self.backpressure;
        let bp = &mut config.guard.backpressure;
        apply!(bp.window, b.window_ms, ms);
        apply!(bp.max_global_per_window, b.max_global_per_window);
        apply!(bp.max_user_per_window, b.max_user_per_window);
        apply!(bp.max_queue_size, b.max_queue_size);
        apply!(bp.queue_retry_after, b.queue_retry_after_ms, ms);

        let s = self.slots;
        let slots = &mut config.guard.slots;
        apply!(slots.max_global, s.max_global);
        apply!(slots.max_per_user, s.max_per_user);
        slots.max_per_template.extend(s.max_per_template);
        apply!(slots.acquire_timeout, s.acquire_timeout_ms, ms);
        apply!(slots.max_waiting, s.max_waiting);

        let d = self.dlq;
        let dlq = &mut config.guard.dlq;
        apply!(dlq.max_size, d.max_size);
        apply!(dlq.ttl, d.ttl_ms, ms);
        apply!(dlq.max_retries, d.max_retries);
        apply!(dlq.cleanup_interval, d.cleanup_interval_ms, ms);

        apply!(config.streams.buffer_capacity, self.streams.buffer_capacity);
        apply!(config.streams.retention, self.streams.retention_ms, ms);

        let e = self.executor;
        let retry = &mut config.executor.default_retry;
        apply!(config.executor.heartbeat_interval, e.heartbeat_interval_ms, ms);
        apply!(retry.max_attempts, e.max_attempts);
        apply!(retry.initial_delay, e.initial_delay_ms, ms);
        apply!(retry.max_delay, e.max_delay_ms, ms);
        apply!(retry.multiplier, e.multiplier);

        let r = self.recovery;
        apply!(config.recovery.interval, r.interval_ms, ms);
        apply!(config.recovery.stale_threshold, r.stale_threshold_ms, ms);
        apply!(config.recovery.poll_interval, r.poll_interval_ms, ms);
        apply!(config.recovery.wait_timeout, r.wait_timeout_ms, ms);
        apply!(config.recovery.max_concurrent, r.max_concurrent);

        apply!(config.scheduler_interval, self.system.scheduler_interval_ms, ms);
        apply!(config.shutdown_grace, self.system.shutdown_grace_ms, ms);
        config
    }

    /// Flush manager config for `mode` with the `[flush]` knobs applied.
    pub fn flush_config(&self, wal_path: impl Into<PathBuf>, mode: FlushMode) -> FlushManagerConfig {
        let f = self.flush.clone();
        let mut worker = FlushWorkerConfig::new(wal_path);
        apply!(worker.flush_interval, f.interval_ms, ms);
        apply!(worker.max_batch_size, f.max_batch_size);
        apply!(worker.max_retries, f.max_retries);
        apply!(worker.retry_base_delay, f.retry_base_delay_ms, ms);
        apply!(worker.circuit_breaker_threshold, f.circuit_breaker_threshold);
        apply!(worker.circuit_breaker_reset, f.circuit_breaker_reset_ms, ms);
        apply!(worker.shutdown_timeout, f.shutdown_timeout_ms, ms);

        let mut config = FlushManagerConfig::new(mode, worker);
        apply!(config.health_check_interval, f.health_check_interval_ms, ms);
        apply!(config.max_restarts, f.max_restarts);
        apply!(config.restart_delay, f.restart_delay_ms, ms);
        apply!(config.ready_timeout, f.ready_timeout_ms, ms);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_keeps_defaults() {
        let config = EngineSettings::parse("").unwrap().into_system_config("/tmp/t.log");
        assert_eq!(config.wal.path, PathBuf::from("/tmp/t.log"));
        assert_eq!(config.guard.slots.max_global, 10);
        assert_eq!(config.scheduler_interval, Duration::from_millis(100));
    }

    #[test]
    fn millisecond_knobs_convert() {
        let settings = EngineSettings::parse(
            r#"
            [executor]
            heartbeat_interval_ms = 250
            max_attempts = 5

            [slots]
            max_global = 2
            max_per_template = { report = 1 }
            "#,
        )
        .unwrap();
        let config = settings.into_system_config("wal.log");
        assert_eq!(config.executor.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.executor.default_retry.max_attempts, 5);
        assert_eq!(config.guard.slots.max_global, 2);
        assert_eq!(config.guard.slots.max_per_template.get("report"), Some(&1));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = EngineSettings::parse("[wal]\nmax_size = 3\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn sub_one_multiplier_is_rejected() {
        assert!(EngineSettings::parse("[executor]\nmultiplier = 0.5\n").is_err());
    }
}
