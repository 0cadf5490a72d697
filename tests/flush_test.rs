//! WAL to repository: resume, in-process and subprocess workers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use taskwal::engine::{
    RunOptions, TaskDefinition, TaskHandler, TaskRegistry, TaskSystem, TaskSystemConfig,
};
use taskwal::event::{TaskEvent, TaskEventKind};
use taskwal::flush::{FlushManager, FlushManagerConfig, FlushWorker, FlushWorkerConfig};
use taskwal::model::{Task, TaskStatus};
use taskwal::storage::{InMemoryTaskRepository, SqliteTaskRepository, TaskRepository};
use taskwal::wal::{EventLog, EventLogConfig, EventLogEntryType};

async fn append(log: &EventLog, task: &Task, kind: TaskEventKind) {
    let entry = TaskEvent::new(task, kind).to_log_entry().unwrap().unwrap();
    log.append_entry(&entry, None).await.unwrap();
}

/// Writes a full lifecycle for one task: created, start, heartbeat, complete.
async fn write_lifecycle(log: &EventLog, task: &Task) {
    append(log, task, TaskEventKind::created(task)).await;
    append(log, task, TaskEventKind::Start { attempt: 1 }).await;
    append(log, task, TaskEventKind::Heartbeat).await;
    append(
        log,
        task,
        TaskEventKind::Complete {
            status: TaskStatus::Completed,
            result: Some(json!({ "ok": true })),
            error: None,
            duration_ms: 3,
        },
    )
    .await;
}

fn worker_config(path: &Path) -> FlushWorkerConfig {
    let mut config = FlushWorkerConfig::new(path);
    config.flush_interval = Duration::from_millis(10);
    config.retry_base_delay = Duration::from_millis(1);
    config.shutdown_timeout = Duration::from_secs(2);
    config
}

#[tokio::test]
async fn a_new_worker_resumes_from_the_flush_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.log");
    let log = EventLog::open(EventLogConfig::new(&path)).await.unwrap();
    let repo = Arc::new(InMemoryTaskRepository::new());
    let first = Task::new("echo", json!(1), None, None).unwrap();
    write_lifecycle(&log, &first).await;

    let mut worker = FlushWorker::new(worker_config(&path), repo.clone()).await.unwrap();
    assert_eq!(worker.flush_once().await.unwrap(), 4);
    assert_eq!(worker.checkpoint(), 4);
    drop(worker);

    let stored = repo.find_by_id(&first.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.result, Some(json!({ "ok": true })));
    let types: Vec<EventLogEntryType> = repo
        .get_events(&first.id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.entry_type)
        .collect();
    assert_eq!(
        types,
        vec![
            EventLogEntryType::TaskCreated,
            EventLogEntryType::TaskStart,
            EventLogEntryType::TaskComplete
        ]
    );

    let second = Task::new("echo", json!(2), None, None).unwrap();
    append(&log, &second, TaskEventKind::created(&second)).await;

    let mut worker = FlushWorker::new(worker_config(&path), repo.clone()).await.unwrap();
    assert_eq!(worker.checkpoint(), 4);
    assert_eq!(worker.flush_once().await.unwrap(), 1);
    assert_eq!(worker.flush_once().await.unwrap(), 0);
    assert_eq!(repo.batch_count(), 2);
    assert_eq!(repo.task_count().await, 2);
}

#[tokio::test]
async fn rotation_only_compacts_what_the_worker_flushed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.log");
    let log = EventLog::open(EventLogConfig::new(&path)).await.unwrap();
    let repo = Arc::new(InMemoryTaskRepository::new());
    let flushed = Task::new("echo", json!(1), None, None).unwrap();
    write_lifecycle(&log, &flushed).await;

    let mut worker = FlushWorker::new(worker_config(&path), repo).await.unwrap();
    worker.drain(Duration::from_secs(2)).await.unwrap();
    assert_eq!(worker.checkpoint(), 4);

    let pending = Task::new("echo", json!(2), None, None).unwrap();
    write_lifecycle(&log, &pending).await;
    log.rotate().await.unwrap();

    // The unflushed task keeps every entry, its heartbeat included.
    let remaining = log.read_all().await.unwrap();
    assert_eq!(remaining.len(), 4);
    assert!(remaining.iter().all(|e| e.entry.task_id == pending.id));
}

#[tokio::test]
async fn in_process_flush_feeds_the_system_repository() {
    let dir = tempfile::tempdir().unwrap();
    let wal_path = dir.path().join("events.log");
    let repo = Arc::new(InMemoryTaskRepository::new());
    let mut config = TaskSystemConfig::new(EventLogConfig::new(&wal_path));
    config.scheduler_interval = Duration::from_millis(10);
    config.recovery.interval = Duration::ZERO;
    config.flush = Some(FlushManagerConfig::in_process(
        worker_config(&wal_path),
        repo.clone(),
    ));
    let system = TaskSystem::init(config, Arc::new(TaskRegistry::new()), repo.clone())
        .await
        .unwrap();
    system
        .register_task(TaskDefinition::new(
            "echo",
            TaskHandler::once(|input, _| async move { Ok(input) }),
        ))
        .unwrap();

    let handle = system.run("echo", RunOptions::new(json!("hi"))).await.unwrap();
    handle.wait().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stored = repo.find_by_id(handle.id()).await.unwrap();
        if matches!(&stored, Some(t) if t.status == TaskStatus::Completed) {
            assert_eq!(stored.unwrap().result, Some(json!("hi")));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "task never flushed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = system.get_stats().await;
    assert!(stats.flush.unwrap().entries_flushed >= 3);
    system.shutdown(Default::default()).await.unwrap();
}

#[tokio::test]
async fn subprocess_worker_flushes_into_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let wal_path = dir.path().join("events.log");
    let db_path = dir.path().join("tasks.db");
    let database_url = format!("sqlite://{}", db_path.display());

    let log = EventLog::open(EventLogConfig::new(&wal_path)).await.unwrap();
    let task = Task::new("echo", json!({ "n": 7 }), None, None).unwrap();
    write_lifecycle(&log, &task).await;

    let manager = FlushManager::start(FlushManagerConfig::subprocess(
        worker_config(&wal_path),
        env!("CARGO_BIN_EXE_taskd"),
        SecretString::from(database_url.clone()),
    ))
    .await
    .unwrap();
    assert!(manager.is_alive().await);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stats = manager.stats().await.unwrap();
        if stats.last_checkpoint == 4 {
            assert_eq!(stats.entries_flushed, 4);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "worker never caught up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    manager.shutdown().await.unwrap();
    assert!(!manager.is_alive().await);
    assert_eq!(
        log.reader().read_flush_checkpoint().await.unwrap(),
        Some(4)
    );

    let repo = SqliteTaskRepository::connect(&database_url).await.unwrap();
    let stored = repo.find_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.input, json!({ "n": 7 }));
    assert_eq!(repo.get_events(&task.id).await.unwrap().len(), 3);
    repo.close().await.unwrap();
}
