//! Resumable event streams.

use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use taskwal::error::Error;
use taskwal::event::{TaskEvent, TaskEventKind};
use taskwal::model::Task;
use taskwal::stream::{StreamConfig, StreamManager, StreamOptions};
use tokio_util::sync::CancellationToken;

fn progress(task: &Task, n: i64) -> TaskEvent {
    TaskEvent::new(task, TaskEventKind::Progress { data: json!(n) })
}

#[tokio::test]
async fn generator_replays_then_follows_until_close() {
    let streams = std::sync::Arc::new(StreamManager::new(StreamConfig::default()));
    let task = Task::new("echo", json!(1), None, None).unwrap();
    let key = task.idempotency_key.clone();
    streams.create_stream(&key);
    streams.push(&key, progress(&task, 1));
    streams.push(&key, progress(&task, 2));

    let mut events = streams.create_generator(&key, StreamOptions::default());
    assert_eq!(events.next().await.unwrap().unwrap().seq, 1);
    assert_eq!(events.next().await.unwrap().unwrap().seq, 2);

    let producer = {
        let streams = std::sync::Arc::clone(&streams);
        let key = key.clone();
        let task = task.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            streams.push(&key, progress(&task, 3));
            streams.close(&key);
        })
    };

    assert_eq!(events.next().await.unwrap().unwrap().seq, 3);
    assert!(events.next().await.is_none());
    producer.await.unwrap();
}

#[tokio::test]
async fn resumes_after_last_seen_seq() {
    let streams = StreamManager::new(StreamConfig::default());
    let task = Task::new("echo", json!(1), None, None).unwrap();
    let key = task.idempotency_key.clone();
    for n in 1..=5 {
        streams.push(&key, progress(&task, n));
    }
    streams.close(&key);

    let seqs: Vec<u64> = streams
        .create_generator(
            &key,
            StreamOptions {
                last_seq: 3,
                cancel: None,
            },
        )
        .map(|item| item.unwrap().seq)
        .collect()
        .await;
    assert_eq!(seqs, vec![4, 5]);
}

#[tokio::test]
async fn falling_behind_the_buffer_is_an_overflow() {
    let streams = StreamManager::new(StreamConfig {
        buffer_capacity: 3,
        retention: Duration::from_secs(60),
    });
    let task = Task::new("echo", json!(1), None, None).unwrap();
    let key = task.idempotency_key.clone();
    for n in 1..=10 {
        streams.push(&key, progress(&task, n));
    }

    let mut events = streams.create_generator(
        &key,
        StreamOptions {
            last_seq: 2,
            cancel: None,
        },
    );
    let err = events.next().await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        Error::StreamOverflow {
            requested: 2,
            oldest: 8
        }
    ));
    assert!(events.next().await.is_none());
    assert_eq!(streams.stats().overflowed_events, 7);
}

#[tokio::test]
async fn unknown_stream_is_not_found() {
    let streams = StreamManager::new(StreamConfig::default());
    let task = Task::new("echo", json!(1), None, None).unwrap();
    let mut events = streams.create_generator(&task.idempotency_key, StreamOptions::default());
    assert!(matches!(
        events.next().await.unwrap(),
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn cancel_ends_a_waiting_generator() {
    let streams = StreamManager::new(StreamConfig::default());
    let task = Task::new("echo", json!(1), None, None).unwrap();
    let key = task.idempotency_key.clone();
    streams.create_stream(&key);

    let cancel = CancellationToken::new();
    let mut events = streams.create_generator(
        &key,
        StreamOptions {
            last_seq: 0,
            cancel: Some(cancel.clone()),
        },
    );
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
    });
    let next = tokio::time::timeout(Duration::from_secs(2), events.next())
        .await
        .unwrap();
    assert!(next.is_none());
}

#[tokio::test]
async fn close_all_ends_every_stream() {
    let streams = StreamManager::new(StreamConfig::default());
    let a = Task::new("a", json!(1), None, None).unwrap();
    let b = Task::new("b", json!(1), None, None).unwrap();
    streams.create_stream(&a.idempotency_key);
    streams.create_stream(&b.idempotency_key);
    assert_eq!(streams.stats().active_streams, 2);

    streams.close_all();
    let stats = streams.stats();
    assert_eq!(stats.active_streams, 0);
    assert_eq!(stats.closed_streams, 2);
}
