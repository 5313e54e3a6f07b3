//! Stream bus integration tests: id allocation, cursor-paged reads, and
//! dead-letter bookkeeping.

use pricewire_common::bus::{dlq_stream, EntryId, StreamBus};
use pricewire_common::db::init_database;
use std::collections::HashMap;

async fn test_bus() -> (StreamBus, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = init_database(&dir.path().join("test.db"))
        .await
        .expect("init db");
    (StreamBus::new(pool), dir)
}

fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn xadd_ids_strictly_increase() {
    let (bus, _dir) = test_bus().await;

    let mut last = EntryId::ZERO;
    for i in 0..20 {
        let id = bus
            .xadd("orders", &fields(&[("n", &i.to_string())]))
            .await
            .unwrap();
        assert!(id > last, "id {id} not after {last}");
        last = id;
    }
}

#[tokio::test]
async fn xread_returns_entries_strictly_after_cursor() {
    let (bus, _dir) = test_bus().await;

    let id1 = bus.xadd("s", &fields(&[("n", "1")])).await.unwrap();
    let id2 = bus.xadd("s", &fields(&[("n", "2")])).await.unwrap();
    let id3 = bus.xadd("s", &fields(&[("n", "3")])).await.unwrap();

    let all = bus.xread("s", EntryId::ZERO, 10).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].id, id1);
    assert_eq!(all[2].id, id3);

    // Strictly after: the cursor entry itself is excluded.
    let after_first = bus.xread("s", id1, 10).await.unwrap();
    assert_eq!(after_first.len(), 2);
    assert_eq!(after_first[0].id, id2);

    let after_last = bus.xread("s", id3, 10).await.unwrap();
    assert!(after_last.is_empty());
}

#[tokio::test]
async fn xread_respects_count_and_order() {
    let (bus, _dir) = test_bus().await;

    for i in 0..10 {
        bus.xadd("s", &fields(&[("n", &i.to_string())])).await.unwrap();
    }

    let page = bus.xread("s", EntryId::ZERO, 4).await.unwrap();
    assert_eq!(page.len(), 4);
    let values: Vec<&str> = page.iter().map(|e| e.fields["n"].as_str()).collect();
    assert_eq!(values, ["0", "1", "2", "3"]);
}

#[tokio::test]
async fn xlen_counts_per_stream() {
    let (bus, _dir) = test_bus().await;

    bus.xadd("a", &fields(&[("x", "1")])).await.unwrap();
    bus.xadd("a", &fields(&[("x", "2")])).await.unwrap();
    bus.xadd("b", &fields(&[("x", "3")])).await.unwrap();

    assert_eq!(bus.xlen("a").await.unwrap(), 2);
    assert_eq!(bus.xlen("b").await.unwrap(), 1);
    assert_eq!(bus.xlen("missing").await.unwrap(), 0);
}

#[tokio::test]
async fn push_dlq_preserves_original_payload_and_id() {
    let (bus, _dir) = test_bus().await;

    bus.xadd("jobs", &fields(&[("k", "v")])).await.unwrap();
    let entry = bus.xread("jobs", EntryId::ZERO, 1).await.unwrap().remove(0);

    bus.push_dlq("jobs", &entry, "boom").await.unwrap();

    let dlq = bus
        .xread(&dlq_stream("jobs"), EntryId::ZERO, 10)
        .await
        .unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].fields["stream"], "jobs");
    assert_eq!(dlq[0].fields["entry_id"], entry.id.to_string());
    assert_eq!(dlq[0].fields["error"], "boom");

    let original: HashMap<String, String> =
        serde_json::from_str(&dlq[0].fields["payload"]).unwrap();
    assert_eq!(original["k"], "v");
}

#[tokio::test]
async fn publish_json_round_trips_through_parse_payload() {
    let (bus, _dir) = test_bus().await;

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Doc {
        name: String,
        value: i64,
    }

    let doc = Doc {
        name: "widget".into(),
        value: 42,
    };
    bus.publish_json("docs", &doc).await.unwrap();

    let entry = bus.xread("docs", EntryId::ZERO, 1).await.unwrap().remove(0);
    let parsed: Doc = entry.parse_payload().unwrap();
    assert_eq!(parsed, doc);
}
