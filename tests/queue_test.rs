use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use r_dispatch::db::Db;
use r_dispatch::queue::{InMemoryQueue, LibSqlQueue, QueueStats, WorkQueue};
use r_dispatch::tasks::{Task, TaskType};
use serde_json::Map;

fn task() -> Task {
    Task::new(TaskType::ImageConvert, Map::new())
}

/// Both backends. The database handle is returned so it outlives the queue.
async fn queues() -> (Db, Vec<(&'static str, Arc<dyn WorkQueue>)>) {
    let db = Db::open_memory().await.unwrap();
    let queues: Vec<(&'static str, Arc<dyn WorkQueue>)> = vec![
        ("memory", Arc::new(InMemoryQueue::new())),
        (
            "libsql",
            Arc::new(LibSqlQueue::new(&db).with_poll_interval(Duration::from_millis(5))),
        ),
    ];
    (db, queues)
}

#[tokio::test]
async fn claims_in_fifo_order() {
    let (_db, queues) = queues().await;
    for (name, queue) in queues {
        let tasks: Vec<Task> = (0..3).map(|_| task()).collect();
        for t in &tasks {
            queue.enqueue(t).await.unwrap();
        }

        for t in &tasks {
            let claimed = queue.dequeue(Duration::from_millis(50)).await.unwrap();
            assert_eq!(claimed.map(|c| c.id), Some(t.id.clone()), "{name}");
        }
        assert_eq!(
            queue.stats().await.unwrap(),
            QueueStats {
                pending: 0,
                processing: 3
            },
            "{name}"
        );
    }
}

#[tokio::test]
async fn claimed_payload_round_trips_the_record() {
    let (_db, queues) = queues().await;
    for (name, queue) in queues {
        let mut params = Map::new();
        params.insert("format".into(), "png".into());
        let original = Task::new(TaskType::ImageConvert, params);
        queue.enqueue(&original).await.unwrap();

        let claimed = queue
            .dequeue(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.param("format").as_deref(), Some("png"), "{name}");
        assert_eq!(claimed.task_type, TaskType::ImageConvert, "{name}");
    }
}

#[tokio::test]
async fn empty_queue_returns_none_after_timeout() {
    let (_db, queues) = queues().await;
    for (name, queue) in queues {
        let started = tokio::time::Instant::now();
        let claimed = queue.dequeue(Duration::from_millis(30)).await.unwrap();
        assert!(claimed.is_none(), "{name}");
        assert!(started.elapsed() >= Duration::from_millis(30), "{name}");
    }
}

#[tokio::test]
async fn acknowledge_is_idempotent_and_ignores_unknown_ids() {
    let (_db, queues) = queues().await;
    for (name, queue) in queues {
        let t = task();
        queue.enqueue(&t).await.unwrap();
        queue.dequeue(Duration::from_millis(50)).await.unwrap();

        queue.acknowledge(&t.id).await.unwrap();
        queue.acknowledge(&t.id).await.unwrap();
        queue.acknowledge("no-such-task").await.unwrap();
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default(), "{name}");
    }
}

#[tokio::test]
async fn unacknowledged_claims_stay_in_processing() {
    let (_db, queues) = queues().await;
    for (name, queue) in queues {
        let t = task();
        queue.enqueue(&t).await.unwrap();
        queue.dequeue(Duration::from_millis(50)).await.unwrap();

        // Nothing is redelivered.
        assert!(
            queue
                .dequeue(Duration::from_millis(20))
                .await
                .unwrap()
                .is_none(),
            "{name}"
        );
        assert_eq!(queue.stats().await.unwrap().processing, 1, "{name}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumers_never_share_a_task() {
    let (_db, queues) = queues().await;
    for (name, queue) in queues {
        let mut ids = HashSet::new();
        for _ in 0..40 {
            let t = task();
            ids.insert(t.id.clone());
            queue.enqueue(&t).await.unwrap();
        }

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut claimed = Vec::new();
                    while let Some(t) = queue.dequeue(Duration::from_millis(20)).await.unwrap() {
                        claimed.push(t.id);
                    }
                    claimed
                })
            })
            .collect();

        let mut seen = Vec::new();
        for consumer in consumers {
            seen.extend(consumer.await.unwrap());
        }
        let unique: HashSet<String> = seen.iter().cloned().collect();
        assert_eq!(seen.len(), 40, "{name}: every task claimed exactly once");
        assert_eq!(unique, ids, "{name}");
    }
}

#[tokio::test]
async fn durable_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let t = task();
    {
        let db = Db::open_local(&path).await.unwrap();
        LibSqlQueue::new(&db).enqueue(&t).await.unwrap();
    }

    let db = Db::open_local(&path).await.unwrap();
    let queue = LibSqlQueue::new(&db);
    assert_eq!(queue.stats().await.unwrap().pending, 1);
    let claimed = queue.dequeue(Duration::from_millis(50)).await.unwrap();
    assert_eq!(claimed.map(|c| c.id), Some(t.id));
}
