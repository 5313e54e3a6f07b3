//! Delay queue tests: unique-id dedup, due-time execution, backpressure.

use async_trait::async_trait;
use pricewire_common::db::init_database;
use pricewire_common::delay::{DelayQueue, DelayedJob, DelayedJobHandler};
use pricewire_common::shutdown::ShutdownCoordinator;
use pricewire_common::{Error, WorkerError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

async fn test_queue() -> (DelayQueue, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = init_database(&dir.path().join("test.db"))
        .await
        .expect("init db");
    (DelayQueue::new(pool), dir)
}

struct Collecting {
    handled: Mutex<Vec<serde_json::Value>>,
}

#[async_trait]
impl DelayedJobHandler for Collecting {
    async fn handle(&self, job: &DelayedJob) -> Result<(), WorkerError> {
        self.handled.lock().unwrap().push(job.payload.clone());
        Ok(())
    }
}

#[tokio::test]
async fn add_dedups_on_unique_id() {
    let (queue, _dir) = test_queue().await;

    let payload = serde_json::json!({"glitch": "g1"});
    assert!(queue
        .add("notify", &payload, 1000, Some("notify-g1-pro-elite"))
        .await
        .unwrap());
    assert!(!queue
        .add("notify", &payload, 1000, Some("notify-g1-pro-elite"))
        .await
        .unwrap());
    // A different unique id is a different job.
    assert!(queue
        .add("notify", &payload, 1000, Some("notify-g1-free"))
        .await
        .unwrap());

    assert_eq!(queue.pending("notify").await.unwrap(), 2);
}

#[tokio::test]
async fn add_without_unique_id_never_dedups() {
    let (queue, _dir) = test_queue().await;

    let payload = serde_json::json!({"n": 1});
    assert!(queue.add("q", &payload, 0, None).await.unwrap());
    assert!(queue.add("q", &payload, 0, None).await.unwrap());
    assert_eq!(queue.pending("q").await.unwrap(), 2);
}

#[tokio::test]
async fn full_queue_rejects_with_backpressure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = init_database(&dir.path().join("test.db"))
        .await
        .expect("init db");
    let queue = DelayQueue::with_max_pending(pool, 2);

    let payload = serde_json::json!({});
    queue.add("q", &payload, 60_000, None).await.unwrap();
    queue.add("q", &payload, 60_000, None).await.unwrap();

    match queue.add("q", &payload, 60_000, None).await {
        Err(Error::QueueFull(_)) => {}
        other => panic!("expected QueueFull, got {other:?}"),
    }
}

#[tokio::test]
async fn jobs_run_only_after_their_delay() {
    let (queue, _dir) = test_queue().await;
    let shutdown = ShutdownCoordinator::new(5000);

    queue
        .add("q", &serde_json::json!({"id": "later"}), 1200, None)
        .await
        .unwrap();
    queue
        .add("q", &serde_json::json!({"id": "now"}), 0, None)
        .await
        .unwrap();

    let handler = Arc::new(Collecting {
        handled: Mutex::new(Vec::new()),
    });
    let task = {
        let queue = queue.clone();
        let handler: Arc<dyn DelayedJobHandler> = handler.clone();
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { queue.consume("q", handler, 2, shutdown).await })
    };

    sleep(Duration::from_millis(700)).await;
    {
        let handled = handler.handled.lock().unwrap();
        assert_eq!(handled.len(), 1);
        assert_eq!(handled[0]["id"], "now");
    }

    sleep(Duration::from_millis(1200)).await;
    shutdown.trigger();
    task.await.unwrap().unwrap();

    let handled = handler.handled.lock().unwrap();
    assert_eq!(handled.len(), 2);
    assert_eq!(handled[1]["id"], "later");
}

#[tokio::test]
async fn completed_unique_ids_stay_reserved() {
    let (queue, _dir) = test_queue().await;
    let shutdown = ShutdownCoordinator::new(5000);

    queue
        .add("q", &serde_json::json!({"id": 1}), 0, Some("once"))
        .await
        .unwrap();

    let handler = Arc::new(Collecting {
        handled: Mutex::new(Vec::new()),
    });
    let task = {
        let queue = queue.clone();
        let handler: Arc<dyn DelayedJobHandler> = handler.clone();
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { queue.consume("q", handler, 1, shutdown).await })
    };

    sleep(Duration::from_millis(700)).await;
    assert_eq!(handler.handled.lock().unwrap().len(), 1);

    // The job completed, but its unique id still suppresses a re-add.
    assert!(!queue
        .add("q", &serde_json::json!({"id": 2}), 0, Some("once"))
        .await
        .unwrap());

    sleep(Duration::from_millis(600)).await;
    shutdown.trigger();
    task.await.unwrap().unwrap();
    assert_eq!(handler.handled.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_jobs_park_after_exhausting_attempts() {
    let (queue, _dir) = test_queue().await;
    let shutdown = ShutdownCoordinator::new(5000);

    struct AlwaysMalformed;

    #[async_trait]
    impl DelayedJobHandler for AlwaysMalformed {
        async fn handle(&self, _job: &DelayedJob) -> Result<(), WorkerError> {
            Err(WorkerError::Malformed("bad payload".into()))
        }
    }

    queue
        .add("q", &serde_json::json!({"broken": true}), 0, None)
        .await
        .unwrap();

    let task = {
        let queue = queue.clone();
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            queue
                .consume("q", Arc::new(AlwaysMalformed), 1, shutdown)
                .await
        })
    };

    sleep(Duration::from_millis(700)).await;
    shutdown.trigger();
    task.await.unwrap().unwrap();

    // Non-retryable failure parks the job immediately; nothing waiting.
    assert_eq!(queue.pending("q").await.unwrap(), 0);
    assert!(queue.waiting_jobs("q").await.unwrap().is_empty());
}
