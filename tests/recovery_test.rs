//! Stale-task recovery and the reconnect path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use taskwal::engine::{
    ExecutionOutcome, ExecutorConfig, ReconnectOutcome, RecoveryConfig, TaskDefinition,
    TaskExecutor, TaskHandler, TaskRecovery, TaskRegistry,
};
use taskwal::error::Error;
use taskwal::event::{TaskEvent, TaskEventKind};
use taskwal::guard::{Guard, GuardConfig};
use taskwal::model::{Task, TaskStatus, UserId};
use taskwal::storage::{InMemoryTaskRepository, TaskRepository};
use taskwal::stream::{StreamConfig, StreamManager};
use taskwal::telemetry::NoopHooks;
use taskwal::wal::{EventLog, EventLogConfig, EventLogEvent};
use tokio::sync::Mutex;

struct Fixture {
    _dir: tempfile::TempDir,
    repository: Arc<InMemoryTaskRepository>,
    registry: Arc<TaskRegistry>,
    executor: Arc<TaskExecutor>,
    recovery: Arc<TaskRecovery>,
}

async fn fixture(config: RecoveryConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(
        EventLog::open(EventLogConfig::new(dir.path().join("events.log")))
            .await
            .unwrap(),
    );
    let streams = Arc::new(StreamManager::new(StreamConfig::default()));
    let executor = Arc::new(TaskExecutor::new(
        ExecutorConfig::default(),
        log,
        Arc::clone(&streams),
        Arc::new(NoopHooks),
    ));
    let repository = Arc::new(InMemoryTaskRepository::new());
    let registry = Arc::new(TaskRegistry::new());
    let recovery = Arc::new(TaskRecovery::new(
        config,
        repository.clone(),
        Arc::clone(&registry),
        Arc::new(Guard::new(GuardConfig::default())),
        Arc::clone(&executor),
        streams,
        Arc::new(NoopHooks),
    ));
    Fixture {
        _dir: dir,
        repository,
        registry,
        executor,
        recovery,
    }
}

fn quick() -> RecoveryConfig {
    RecoveryConfig {
        interval: Duration::ZERO,
        stale_threshold: Duration::from_secs(60),
        poll_interval: Duration::from_millis(10),
        wait_timeout: Duration::from_millis(60),
        max_concurrent: 3,
    }
}

/// Stores a task that started and then went quiet `silent_for` ago.
async fn seed_running(repo: &InMemoryTaskRepository, task: &Task, silent_for: chrono::Duration) {
    let kinds = [TaskEventKind::created(task), TaskEventKind::Start { attempt: 1 }];
    let mut batch = Vec::new();
    for (i, kind) in kinds.into_iter().enumerate() {
        let entry = TaskEvent::new(task, kind).to_log_entry().unwrap().unwrap();
        batch.push(EventLogEvent::seal(entry, i as u64 + 1).unwrap());
    }
    repo.execute_batch(&batch).await.unwrap();

    let mut snapshot = task.clone();
    snapshot.start().unwrap();
    snapshot.last_heartbeat_at = Some(Utc::now() - silent_for);
    repo.insert_task(snapshot).await;
}

/// Waits until the handler ran and the recovered execution is over.
async fn wait_for_recovery(fx: &Fixture, task: &Task, calls: &AtomicU32) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while calls.load(Ordering::SeqCst) == 0 || fx.executor.is_running(&task.idempotency_key) {
        assert!(tokio::time::Instant::now() < deadline, "recovery never ran");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn seed_finished(repo: &InMemoryTaskRepository, task: &Task) {
    let mut snapshot = task.clone();
    snapshot.start().unwrap();
    snapshot.complete(json!("stored")).unwrap();
    repo.insert_task(snapshot).await;
}

#[tokio::test]
async fn stale_background_task_is_re_executed() {
    let fx = fixture(quick()).await;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    fx.registry
        .register(TaskDefinition::new(
            "sync",
            TaskHandler::once(move |input, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(input)
                }
            }),
        ))
        .unwrap();
    let task = Task::new("sync", json!({ "page": 1 }), None, None).unwrap();
    seed_running(&fx.repository, &task, chrono::Duration::minutes(10)).await;

    let report = fx.recovery.recover_stale_tasks().await.unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.started, 1);
    assert_eq!(report.failed, 0);

    wait_for_recovery(&fx, &task, &calls).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_long_recovery_does_not_hold_up_the_next_pass() {
    let fx = fixture(quick()).await;
    let release = Arc::new(tokio::sync::Notify::new());
    let gate = Arc::clone(&release);
    fx.registry
        .register(TaskDefinition::new(
            "sync",
            TaskHandler::once(move |input, _| {
                let gate = Arc::clone(&gate);
                async move {
                    if input == json!("slow") {
                        gate.notified().await;
                    }
                    Ok(input)
                }
            }),
        ))
        .unwrap();
    let slow = Task::new("sync", json!("slow"), None, None).unwrap();
    seed_running(&fx.repository, &slow, chrono::Duration::minutes(10)).await;

    let report = tokio::time::timeout(Duration::from_secs(1), fx.recovery.recover_stale_tasks())
        .await
        .expect("a pass returns once its recoveries are started")
        .unwrap();
    assert_eq!(report.started, 1);

    let quick_one = Task::new("sync", json!("quick"), None, None).unwrap();
    seed_running(&fx.repository, &quick_one, chrono::Duration::minutes(10)).await;
    let report = tokio::time::timeout(Duration::from_secs(1), fx.recovery.recover_stale_tasks())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.found, 2);
    assert_eq!(report.started, 1, "only the new task starts");
    assert_eq!(report.skipped, 1, "the slow task is still recovering");

    release.notify_one();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while fx.executor.running_count() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "recoveries never finished");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn recover_handler_sees_the_interrupted_history() {
    let fx = fixture(quick()).await;
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    fx.registry
        .register(
            TaskDefinition::new(
                "sync",
                TaskHandler::once(|_, _| async { Ok(json!("from scratch")) }),
            )
            .with_recover(move |_, recovery, _| {
                let sink = Arc::clone(&sink);
                async move {
                    let names: Vec<&'static str> = recovery
                        .previous_events
                        .iter()
                        .map(|e| e.kind.name())
                        .collect();
                    *sink.lock().await = Some((recovery.reason.clone(), names));
                    Ok(json!("resumed"))
                }
            }),
        )
        .unwrap();
    let task = Task::new("sync", json!(null), None, None).unwrap();
    seed_running(&fx.repository, &task, chrono::Duration::minutes(10)).await;
    let stored = fx.repository.find_by_id(&task.id).await.unwrap().unwrap();

    let outcome = fx
        .recovery
        .recover_task(&stored, "stale heartbeat")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ExecutionOutcome::Completed {
            result: json!("resumed")
        }
    );
    let (reason, names) = seen.lock().await.clone().unwrap();
    assert_eq!(reason, "stale heartbeat");
    assert_eq!(names, vec!["created", "start"]);
}

#[tokio::test]
async fn user_tasks_and_fresh_tasks_are_left_alone() {
    let fx = fixture(quick()).await;
    fx.registry
        .register(TaskDefinition::new(
            "sync",
            TaskHandler::once(|_, _| async { Ok(Value::Null) }),
        ))
        .unwrap();
    let owned = Task::new("sync", json!(1), Some(UserId::new("ada").unwrap()), None).unwrap();
    let fresh = Task::new("sync", json!(2), None, None).unwrap();
    seed_running(&fx.repository, &owned, chrono::Duration::minutes(10)).await;
    seed_running(&fx.repository, &fresh, chrono::Duration::seconds(1)).await;

    let report = fx.recovery.recover_stale_tasks().await.unwrap();
    assert_eq!(report.found, 0);
    assert_eq!(report.started, 0);
}

#[tokio::test]
async fn recovery_of_an_unregistered_task_counts_as_failed() {
    let fx = fixture(quick()).await;
    let task = Task::new("gone", json!(null), None, None).unwrap();
    seed_running(&fx.repository, &task, chrono::Duration::minutes(10)).await;

    let report = fx.recovery.recover_stale_tasks().await.unwrap();
    assert_eq!(report.found, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.started, 0);
}

#[tokio::test]
async fn reconnect_outcomes_follow_the_stored_status() {
    let fx = fixture(quick()).await;
    let ada = UserId::new("ada").unwrap();

    let missing = Task::new("sync", json!(0), Some(ada.clone()), None).unwrap();
    assert!(matches!(
        fx.recovery
            .handle_database_check(&missing.idempotency_key, Some(&ada))
            .await
            .unwrap(),
        ReconnectOutcome::NotFound
    ));

    let done = Task::new("sync", json!(1), Some(ada.clone()), None).unwrap();
    seed_finished(&fx.repository, &done).await;
    match fx
        .recovery
        .handle_database_check(&done.idempotency_key, Some(&ada))
        .await
        .unwrap()
    {
        ReconnectOutcome::Replay { task, .. } => {
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(task.result, Some(json!("stored")));
        }
        other => panic!("expected replay, got {other:?}"),
    }

    let grace = UserId::new("grace").unwrap();
    let err = fx
        .recovery
        .handle_database_check(&done.idempotency_key, Some(&grace))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    let pending = Task::new("sync", json!(2), Some(ada.clone()), None).unwrap();
    fx.repository.insert_task(pending.clone()).await;
    assert!(matches!(
        fx.recovery
            .handle_database_check(&pending.idempotency_key, Some(&ada))
            .await
            .unwrap(),
        ReconnectOutcome::Pending { .. }
    ));
}

#[tokio::test]
async fn reconnect_to_a_live_task_waits_then_gives_up() {
    let fx = fixture(quick()).await;
    let ada = UserId::new("ada").unwrap();
    let task = Task::new("sync", json!(1), Some(ada.clone()), None).unwrap();
    seed_running(&fx.repository, &task, chrono::Duration::seconds(1)).await;

    match fx
        .recovery
        .handle_database_check(&task.idempotency_key, Some(&ada))
        .await
        .unwrap()
    {
        ReconnectOutcome::StillRunning { task } => assert_eq!(task.status, TaskStatus::Running),
        other => panic!("expected still running, got {other:?}"),
    }
}

#[tokio::test]
async fn reconnect_to_a_stale_task_starts_recovery() {
    let fx = fixture(quick()).await;
    let ada = UserId::new("ada").unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    fx.registry
        .register(TaskDefinition::new(
            "sync",
            TaskHandler::once(move |_, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("again"))
                }
            }),
        ))
        .unwrap();
    let task = Task::new("sync", json!(1), Some(ada.clone()), None).unwrap();
    seed_running(&fx.repository, &task, chrono::Duration::minutes(10)).await;

    let outcome = fx
        .recovery
        .handle_database_check(&task.idempotency_key, Some(&ada))
        .await
        .unwrap();
    assert!(matches!(outcome, ReconnectOutcome::Recovering { .. }));

    wait_for_recovery(&fx, &task, &calls).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
