//! Stream consumer framework tests: at-least-once delivery, cursor
//! movement, retry/dead-letter bookkeeping, malformed advancement, and
//! shutdown behavior.

use async_trait::async_trait;
use pricewire_common::bus::{dlq_stream, EntryId, StreamBus, StreamEntry};
use pricewire_common::consumer::{cursor_key, ConsumerConfig, StreamConsumer, StreamHandler};
use pricewire_common::db::init_database;
use pricewire_common::kv::KvStore;
use pricewire_common::metrics::Metrics;
use pricewire_common::shutdown::ShutdownCoordinator;
use pricewire_common::WorkerError;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

struct Harness {
    bus: StreamBus,
    kv: KvStore,
    shutdown: Arc<ShutdownCoordinator>,
    consumer: Arc<StreamConsumer>,
    _dir: tempfile::TempDir,
}

async fn harness(max_retries: u32) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = init_database(&dir.path().join("test.db"))
        .await
        .expect("init db");
    let bus = StreamBus::new(pool.clone());
    let kv = KvStore::new(pool);
    let shutdown = ShutdownCoordinator::new(5000);
    let consumer = Arc::new(StreamConsumer::new(
        bus.clone(),
        kv.clone(),
        Metrics::new(kv.clone()),
        Arc::clone(&shutdown),
        ConsumerConfig {
            batch_size: 10,
            poll_interval_ms: 10,
            max_retries,
        },
    ));
    Harness {
        bus,
        kv,
        shutdown,
        consumer,
        _dir: dir,
    }
}

fn fields(n: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("n".to_string(), n.to_string());
    map
}

async fn cursor_of(kv: &KvStore, stream: &str, group: &str) -> Option<EntryId> {
    kv.get(&cursor_key(stream, group))
        .await
        .unwrap()
        .map(|raw| EntryId::from_str(&raw).unwrap())
}

/// Records handled entry ids and succeeds
struct Recording {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl StreamHandler for Recording {
    async fn handle(&self, entry: &StreamEntry) -> Result<(), WorkerError> {
        self.seen.lock().unwrap().push(entry.fields["n"].clone());
        Ok(())
    }
}

/// Fails with a transient error on every invocation, counting attempts
struct AlwaysFails {
    attempts: AtomicU32,
}

#[async_trait]
impl StreamHandler for AlwaysFails {
    async fn handle(&self, _entry: &StreamEntry) -> Result<(), WorkerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(WorkerError::Transient("upstream 503".into()))
    }
}

struct Malformed;

#[async_trait]
impl StreamHandler for Malformed {
    async fn handle(&self, _entry: &StreamEntry) -> Result<(), WorkerError> {
        Err(WorkerError::Malformed("missing field".into()))
    }
}

#[tokio::test]
async fn entries_are_handled_in_order_and_cursor_advances() {
    let h = harness(5).await;
    for n in ["1", "2", "3"] {
        h.bus.xadd("s", &fields(n)).await.unwrap();
    }
    let last = h.bus.xread("s", EntryId::ZERO, 10).await.unwrap()[2].id;

    let handler = Arc::new(Recording {
        seen: Mutex::new(Vec::new()),
    });
    let task = {
        let consumer = Arc::clone(&h.consumer);
        let handler: Arc<dyn StreamHandler> = handler.clone();
        tokio::spawn(async move { consumer.run("s", "g", handler).await })
    };

    sleep(Duration::from_millis(200)).await;
    h.shutdown.trigger();
    task.await.unwrap().unwrap();

    assert_eq!(*handler.seen.lock().unwrap(), vec!["1", "2", "3"]);
    assert_eq!(cursor_of(&h.kv, "s", "g").await, Some(last));
}

#[tokio::test]
async fn cursor_never_decreases_across_batches() {
    let h = harness(5).await;
    let handler = Arc::new(Recording {
        seen: Mutex::new(Vec::new()),
    });
    let task = {
        let consumer = Arc::clone(&h.consumer);
        let handler: Arc<dyn StreamHandler> = handler.clone();
        tokio::spawn(async move { consumer.run("s", "g", handler).await })
    };

    let mut observed = Vec::new();
    for n in 0..6 {
        h.bus.xadd("s", &fields(&n.to_string())).await.unwrap();
        sleep(Duration::from_millis(60)).await;
        if let Some(cursor) = cursor_of(&h.kv, "s", "g").await {
            observed.push(cursor);
        }
    }

    h.shutdown.trigger();
    task.await.unwrap().unwrap();

    assert!(!observed.is_empty());
    for pair in observed.windows(2) {
        assert!(pair[1] >= pair[0], "cursor regressed: {:?}", pair);
    }
}

#[tokio::test]
async fn transient_failures_retry_then_dead_letter() {
    let h = harness(5).await;
    h.bus.xadd("jobs", &fields("e17")).await.unwrap();
    let entry_id = h.bus.xread("jobs", EntryId::ZERO, 1).await.unwrap()[0].id;

    let handler = Arc::new(AlwaysFails {
        attempts: AtomicU32::new(0),
    });
    let task = {
        let consumer = Arc::clone(&h.consumer);
        let handler: Arc<dyn StreamHandler> = handler.clone();
        tokio::spawn(async move { consumer.run("jobs", "g", handler).await })
    };

    sleep(Duration::from_millis(500)).await;
    h.shutdown.trigger();
    task.await.unwrap().unwrap();

    // Exactly max_retries attempts, then the entry was dead-lettered and
    // the cursor moved past it.
    assert_eq!(handler.attempts.load(Ordering::SeqCst), 5);
    assert_eq!(cursor_of(&h.kv, "jobs", "g").await, Some(entry_id));

    let dlq = h
        .bus
        .xread(&dlq_stream("jobs"), EntryId::ZERO, 10)
        .await
        .unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].fields["entry_id"], entry_id.to_string());
    assert_eq!(dlq[0].fields["stream"], "jobs");
    assert!(dlq[0].fields["error"].contains("upstream 503"));
}

#[tokio::test]
async fn entry_after_dead_letter_is_still_processed() {
    let h = harness(2).await;
    h.bus.xadd("jobs", &fields("bad")).await.unwrap();
    h.bus.xadd("jobs", &fields("good")).await.unwrap();

    struct FailFirst {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StreamHandler for FailFirst {
        async fn handle(&self, entry: &StreamEntry) -> Result<(), WorkerError> {
            let n = entry.fields["n"].clone();
            if n == "bad" {
                return Err(WorkerError::Transient("boom".into()));
            }
            self.seen.lock().unwrap().push(n);
            Ok(())
        }
    }

    let handler = Arc::new(FailFirst {
        seen: Mutex::new(Vec::new()),
    });
    let task = {
        let consumer = Arc::clone(&h.consumer);
        let handler: Arc<dyn StreamHandler> = handler.clone();
        tokio::spawn(async move { consumer.run("jobs", "g", handler).await })
    };

    sleep(Duration::from_millis(400)).await;
    h.shutdown.trigger();
    task.await.unwrap().unwrap();

    assert_eq!(*handler.seen.lock().unwrap(), vec!["good"]);
    assert_eq!(h.bus.xlen(&dlq_stream("jobs")).await.unwrap(), 1);
}

#[tokio::test]
async fn malformed_entries_advance_without_dead_letter() {
    let h = harness(5).await;
    h.bus.xadd("s", &fields("1")).await.unwrap();
    h.bus.xadd("s", &fields("2")).await.unwrap();
    let last = h.bus.xread("s", EntryId::ZERO, 10).await.unwrap()[1].id;

    let task = {
        let consumer = Arc::clone(&h.consumer);
        tokio::spawn(async move { consumer.run("s", "g", Arc::new(Malformed)).await })
    };

    sleep(Duration::from_millis(200)).await;
    h.shutdown.trigger();
    task.await.unwrap().unwrap();

    assert_eq!(cursor_of(&h.kv, "s", "g").await, Some(last));
    assert_eq!(h.bus.xlen(&dlq_stream("s")).await.unwrap(), 0);
}

#[tokio::test]
async fn shutdown_stops_before_next_entry() {
    let h = harness(5).await;
    h.bus.xadd("s", &fields("1")).await.unwrap();
    h.bus.xadd("s", &fields("2")).await.unwrap();
    let first = h.bus.xread("s", EntryId::ZERO, 10).await.unwrap()[0].id;

    struct TriggerOnFirst {
        shutdown: Arc<ShutdownCoordinator>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StreamHandler for TriggerOnFirst {
        async fn handle(&self, entry: &StreamEntry) -> Result<(), WorkerError> {
            self.seen.lock().unwrap().push(entry.fields["n"].clone());
            self.shutdown.trigger();
            Ok(())
        }
    }

    let handler = Arc::new(TriggerOnFirst {
        shutdown: Arc::clone(&h.shutdown),
        seen: Mutex::new(Vec::new()),
    });
    let task = {
        let consumer = Arc::clone(&h.consumer);
        let handler: Arc<dyn StreamHandler> = handler.clone();
        tokio::spawn(async move { consumer.run("s", "g", handler).await })
    };
    task.await.unwrap().unwrap();

    // The in-flight entry completed and committed; the next one was never
    // started and stays ahead of the cursor.
    assert_eq!(*handler.seen.lock().unwrap(), vec!["1"]);
    assert_eq!(cursor_of(&h.kv, "s", "g").await, Some(first));
}

#[tokio::test]
async fn fatal_handler_error_aborts_the_consumer() {
    let h = harness(5).await;
    h.bus.xadd("s", &fields("1")).await.unwrap();

    struct Fatal;

    #[async_trait]
    impl StreamHandler for Fatal {
        async fn handle(&self, _entry: &StreamEntry) -> Result<(), WorkerError> {
            Err(WorkerError::Fatal("unrecoverable state".into()))
        }
    }

    let result = h.consumer.run("s", "g", Arc::new(Fatal)).await;
    assert!(result.is_err());
    assert_eq!(cursor_of(&h.kv, "s", "g").await, None);
}
