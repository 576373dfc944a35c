//! Integration tests for the live stream driver

mod common;

use atlas_indexer::pipeline::live::LiveDriver;
use common::{dns_result, harness, probe_record, FakeAtlas, FakeStream, MemorySink};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn test_flushes_at_chunk_size_and_delivers_remainder() {
    let h = harness(
        FakeAtlas {
            archive: vec![probe_record(1), probe_record(2)],
            ..Default::default()
        },
        MemorySink::default(),
        2,
    )
    .await;
    let events = (0..5)
        .map(|i| dns_result(if i % 2 == 0 { 1001 } else { 1004 }, 1 + (i % 2) as u32, 1_700_000_000 + i))
        .collect();

    let stats = LiveDriver::new(Arc::new(FakeStream { events }), h.ingestor.clone())
        .run(&[1001, 1004])
        .await
        .unwrap();

    assert_eq!(h.sink.batch_sizes(), vec![2, 2, 1]);
    assert_eq!(stats.indexed, 5);
    assert_eq!(stats.processed, 5);
}

#[tokio::test]
async fn test_fan_out_keeps_batches_at_chunk_size() {
    let h = harness(
        FakeAtlas {
            archive: vec![probe_record(1)],
            ..Default::default()
        },
        MemorySink::default(),
        2,
    )
    .await;
    let event = json!({
        "type": "dns", "msm_id": 1001, "prb_id": 1, "timestamp": 1_700_000_000,
        "resultset": [
            {"af": 4, "dst_addr": "a", "result": {"rt": 1.0}},
            {"af": 4, "dst_addr": "b", "result": {"rt": 2.0}},
            {"af": 6, "dst_addr": "c", "result": {"rt": 3.0}}
        ]
    });

    let stats = LiveDriver::new(Arc::new(FakeStream { events: vec![event] }), h.ingestor.clone())
        .run(&[1001])
        .await
        .unwrap();

    assert_eq!(stats.documents, 3);
    assert_eq!(h.sink.batch_sizes(), vec![2, 1]);
}

#[tokio::test]
async fn test_rejections_and_timeouts_are_counted() {
    let h = harness(
        FakeAtlas {
            archive: vec![probe_record(1)],
            ..Default::default()
        },
        MemorySink {
            timeout_calls: HashSet::from([1]),
            ..Default::default()
        },
        1,
    )
    .await;
    let events = vec![
        dns_result(1001, 1, 10),
        dns_result(1001, 1, 20),
        json!({"type": "ping", "msm_id": 1001, "prb_id": 1, "timestamp": 30, "avg": 1.0}),
        json!({"type": "ping", "msm_id": 1001, "prb_id": 1, "timestamp": 40, "avg": 2.0}),
        dns_result(1001, 7, 50),
    ];

    let stats = LiveDriver::new(Arc::new(FakeStream { events }), h.ingestor.clone())
        .run(&[1001])
        .await
        .unwrap();

    assert_eq!(stats.processed, 5);
    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.indexed, 3);
    assert_eq!(stats.unresolved, 1);
    // one for the unhandled kind, one for the unknown probe
    assert_eq!(stats.warnings_emitted, 2);
    assert_eq!(h.sink.batch_sizes(), vec![1, 1, 1]);
}

#[tokio::test]
async fn test_unhandled_kind_warned_once_per_run() {
    let h = harness(
        FakeAtlas {
            archive: vec![probe_record(1)],
            ..Default::default()
        },
        MemorySink::default(),
        10,
    )
    .await;
    let ping = |ts: i64| json!({"type": "ping", "msm_id": 1001, "prb_id": 1, "timestamp": ts, "avg": 1.0});

    let first = LiveDriver::new(
        Arc::new(FakeStream {
            events: vec![ping(10), ping(20)],
        }),
        h.ingestor.clone(),
    )
    .run(&[1001])
    .await
    .unwrap();
    let second = LiveDriver::new(Arc::new(FakeStream { events: vec![ping(30)] }), h.ingestor.clone())
        .run(&[1001])
        .await
        .unwrap();

    assert_eq!(first.warnings_emitted, 1);
    assert_eq!(second.warnings_emitted, 1);
    assert_eq!(first.indexed + second.indexed, 3);
}
