use std::time::Duration;

use secrecy::ExposeSecret;
use taskwal::config::{Config, EngineSettings};
use taskwal::flush::FlushMode;

#[test]
fn config_from_env_requires_the_wal_path() {
    // Env vars are process-wide: keep every env-touching check in this one test.
    unsafe {
        std::env::remove_var("TASKWAL_WAL_PATH");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("TASKWAL_WAL_PATH", "/var/lib/taskwal/events.log");
        std::env::set_var("DATABASE_URL", "sqlite:///var/lib/taskwal/tasks.db");
        std::env::set_var("OTEL_ENDPOINT", "");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.wal_path.to_str(), Some("/var/lib/taskwal/events.log"));
    assert_eq!(
        config.database_url.as_ref().map(|u| u.expose_secret().to_string()),
        Some("sqlite:///var/lib/taskwal/tasks.db".to_string())
    );
    assert!(config.otel_endpoint.is_none(), "empty values count as unset");
    assert!(!config.log_level.is_empty());
    assert!(!format!("{config:?}").contains("tasks.db"));

    unsafe {
        std::env::remove_var("TASKWAL_WAL_PATH");
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("OTEL_ENDPOINT");
    }
}

#[test]
fn settings_file_overrides_component_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taskwal.toml");
    std::fs::write(
        &path,
        r#"
[wal]
max_file_size = 1048576
respect_flush_checkpoint = false

[backpressure]
max_user_per_window = 4

[slots]
max_global = 2
max_per_template = { "report" = 1 }

[executor]
max_attempts = 5
multiplier = 1.5

[recovery]
interval_ms = 0

[flush]
interval_ms = 250
max_restarts = 1

[system]
scheduler_interval_ms = 20
"#,
    )
    .unwrap();

    let settings = EngineSettings::load(&path).unwrap();
    let flush = settings.flush_config(
        "/tmp/events.log",
        FlushMode::Subprocess {
            program: "taskd".into(),
            args: vec!["flush-worker".into()],
            database_url: "sqlite::memory:".to_string().into(),
        },
    );
    assert_eq!(flush.worker.flush_interval, Duration::from_millis(250));
    assert_eq!(flush.max_restarts, 1);

    let config = settings.into_system_config("/tmp/events.log");
    assert_eq!(config.wal.max_file_size, 1_048_576);
    assert!(!config.wal.respect_flush_checkpoint);
    assert_eq!(config.guard.backpressure.max_user_per_window, 4);
    assert_eq!(config.guard.slots.max_global, 2);
    assert_eq!(config.guard.slots.max_per_template.get("report"), Some(&1));
    assert_eq!(config.executor.default_retry.max_attempts, 5);
    assert_eq!(config.executor.default_retry.multiplier, 1.5);
    assert_eq!(config.recovery.interval, Duration::ZERO);
    assert_eq!(config.scheduler_interval, Duration::from_millis(20));
    assert!(config.flush.is_none());
}

#[test]
fn missing_settings_file_is_a_config_error() {
    let err = EngineSettings::load(std::path::Path::new("/nonexistent/taskwal.toml")).unwrap_err();
    assert_eq!(err.as_label(), "config");
}
