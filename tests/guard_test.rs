//! Admission control through the combined guard.

use std::time::Duration;

use serde_json::json;
use taskwal::error::{BackpressureReason, Error};
use taskwal::guard::{Guard, GuardConfig, SlotConfig};
use taskwal::model::{Task, TaskStatus, UserId};

fn user_task(user: &str, n: i64) -> Task {
    Task::new(
        "report",
        json!({ "n": n }),
        Some(UserId::new(user).unwrap()),
        None,
    )
    .unwrap()
}

#[tokio::test]
async fn full_queue_frees_up_once_a_slot_is_taken() {
    let mut config = GuardConfig::default();
    config.backpressure.max_queue_size = 1;
    let guard = Guard::new(config);

    let first = user_task("ada", 1);
    let second = user_task("ada", 2);
    guard.admit(&first).unwrap();

    let err = guard.admit(&second).unwrap_err();
    assert!(matches!(
        err,
        Error::Backpressure {
            reason: BackpressureReason::QueueFull,
            ..
        }
    ));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

    guard.acquire_slot(&first).await.unwrap();
    guard.admit(&second).unwrap();
    assert_eq!(guard.stats().slots.active, 1);
}

#[tokio::test]
async fn user_window_reports_time_until_oldest_expires() {
    let mut config = GuardConfig::default();
    config.backpressure.max_user_per_window = 2;
    config.backpressure.window = Duration::from_secs(60);
    let guard = Guard::new(config);

    guard.admit(&user_task("ada", 1)).unwrap();
    guard.admit(&user_task("ada", 2)).unwrap();
    let err = guard.admit(&user_task("ada", 3)).unwrap_err();
    let retry_after = err.retry_after().unwrap();
    assert!(retry_after > Duration::from_secs(50));
    assert!(retry_after <= Duration::from_secs(60));

    // Another user has their own window.
    guard.admit(&user_task("grace", 1)).unwrap();
}

#[tokio::test]
async fn per_user_slot_limit_times_out() {
    let guard = Guard::new(GuardConfig {
        slots: SlotConfig {
            max_per_user: 1,
            acquire_timeout: Duration::from_millis(30),
            ..SlotConfig::default()
        },
        ..GuardConfig::default()
    });
    let first = user_task("ada", 1);
    let second = user_task("ada", 2);
    guard.admit(&first).unwrap();
    guard.admit(&second).unwrap();

    guard.acquire_slot(&first).await.unwrap();
    let err = guard.acquire_slot(&second).await.unwrap_err();
    assert!(matches!(err, Error::SlotTimeout(_)));
    assert!(err.is_retryable());

    // Both left the admitted queue, whatever happened at the slot layer.
    assert_eq!(guard.backpressure().queued(), 0);
}

#[tokio::test]
async fn released_slot_goes_to_the_waiter() {
    let guard = std::sync::Arc::new(Guard::new(GuardConfig {
        slots: SlotConfig {
            max_global: 1,
            ..SlotConfig::default()
        },
        ..GuardConfig::default()
    }));
    let first = user_task("ada", 1);
    let second = user_task("grace", 1);
    guard.acquire_slot(&first).await.unwrap();

    let waiter = {
        let guard = std::sync::Arc::clone(&guard);
        let second = second.clone();
        tokio::spawn(async move { guard.acquire_slot(&second).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(guard.slots().waiting(), 1);

    guard.release_slot(&first);
    waiter.await.unwrap().unwrap();
    assert_eq!(guard.slots().active(), 1);
}

#[tokio::test]
async fn dead_lettered_keys_are_quarantined_until_retried() {
    let guard = Guard::new(GuardConfig::default());
    let mut task = user_task("ada", 1);
    task.start().unwrap();
    task.fail("boom").unwrap();
    guard.dead_letter(task.clone(), "retry_exhausted", Some("boom".into()));

    let err = guard.admit(&task).unwrap_err();
    assert!(matches!(
        err,
        Error::Backpressure {
            reason: BackpressureReason::DeadLettered,
            ..
        }
    ));
    assert!(err.retry_after().unwrap() > Duration::from_secs(3600));

    let retried = guard.dlq().retry(&task.idempotency_key).unwrap();
    assert_eq!(retried.status, TaskStatus::Created);
    assert_eq!(retried.attempt, 0);
    assert!(guard.dlq().is_empty());

    // Failing again keeps the retry count.
    guard.dead_letter(task.clone(), "retry_exhausted", None);
    assert_eq!(guard.dlq().get(&task.idempotency_key).unwrap().retry_count, 1);
}

#[tokio::test]
async fn recovery_slots_are_bounded() {
    let guard = Guard::new(GuardConfig {
        max_recovery_slots: 1,
        ..GuardConfig::default()
    });
    let slot = guard.recovery_slot().unwrap();
    assert!(guard.recovery_slot().is_none());
    assert_eq!(guard.stats().recovery_in_use, 1);
    drop(slot);
    assert!(guard.recovery_slot().is_some());
}
