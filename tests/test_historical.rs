//! Integration tests for historical replay

mod common;

use atlas_indexer::pipeline::historical::HistoricalDriver;
use common::{dns_result, harness, probe_record, FakeAtlas, MemorySink};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::Ordering;

const DAY: i64 = 86_400;
const T0: i64 = 1_400_000_000;

/// Effective range is clamped to the creation time and to "now"
#[tokio::test]
async fn test_windows_start_at_creation_and_end_before_now() {
    let h = harness(
        FakeAtlas {
            archive: vec![probe_record(1)],
            start_time: Some(T0 + DAY),
            results: vec![
                dns_result(1001, 1, T0 + 10),
                dns_result(1001, 1, T0 + DAY + 5),
                dns_result(1001, 1, T0 + 2 * DAY + 100),
            ],
            ..Default::default()
        },
        MemorySink::default(),
        200,
    )
    .await;

    let stats = HistoricalDriver::new(h.atlas.clone(), h.ingestor.clone(), T0, T0 + 100 * DAY, DAY)
        .with_now(T0 + 3 * DAY)
        .run(&[1001])
        .await
        .unwrap();

    let windows = h.atlas.windows.lock().unwrap().clone();
    assert_eq!(
        windows,
        vec![
            (T0 + DAY, T0 + 2 * DAY),
            (T0 + 2 * DAY + 1, T0 + 3 * DAY + 1),
        ]
    );
    // one batch per window with results
    assert_eq!(h.sink.batch_sizes(), vec![1, 1]);
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.indexed, 2);
}

#[tokio::test]
async fn test_delivery_timeout_does_not_stop_the_run() {
    let h = harness(
        FakeAtlas {
            archive: vec![probe_record(1), probe_record(2)],
            results: vec![
                dns_result(1001, 1, T0 + 1),
                dns_result(1001, 2, T0 + 2),
                dns_result(1001, 1, T0 + DAY + 10),
                dns_result(1001, 2, T0 + 2 * DAY + 10),
            ],
            ..Default::default()
        },
        MemorySink {
            timeout_calls: HashSet::from([0]),
            ..Default::default()
        },
        200,
    )
    .await;

    let stats = HistoricalDriver::new(h.atlas.clone(), h.ingestor.clone(), T0, T0 + 3 * DAY, DAY)
        .with_now(T0 + 10 * DAY)
        .run(&[1001])
        .await
        .unwrap();

    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.indexed, 2);
    assert_eq!(h.sink.batch_sizes(), vec![1, 1]);
}

#[tokio::test]
async fn test_missing_prb_id_is_a_parse_error() {
    let h = harness(
        FakeAtlas {
            archive: vec![probe_record(1)],
            results: vec![
                json!({"type": "dns", "msm_id": 1001, "timestamp": T0 + 1}),
                dns_result(1001, 1, T0 + 2),
            ],
            ..Default::default()
        },
        MemorySink::default(),
        200,
    )
    .await;

    let stats = HistoricalDriver::new(h.atlas.clone(), h.ingestor.clone(), T0, T0 + 10, DAY)
        .with_now(T0 + DAY)
        .run(&[1001])
        .await
        .unwrap();

    assert_eq!(stats.processed, 2);
    assert_eq!(stats.parse_errors, 1);
    assert_eq!(stats.indexed, 1);
}

#[tokio::test]
async fn test_fetch_failure_aborts_run() {
    let h = harness(
        FakeAtlas {
            archive: vec![probe_record(1)],
            ..Default::default()
        },
        MemorySink::default(),
        200,
    )
    .await;
    h.atlas.fail_results.store(true, Ordering::SeqCst);

    let result = HistoricalDriver::new(h.atlas.clone(), h.ingestor.clone(), T0, T0 + DAY, DAY)
        .with_now(T0 + 2 * DAY)
        .run(&[1001])
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_unknown_probe_warned_once_across_windows() {
    let h = harness(
        FakeAtlas {
            archive: vec![probe_record(1)],
            results: vec![
                dns_result(1001, 1, T0 + 1),
                dns_result(1001, 99, T0 + 5),
                dns_result(1001, 99, T0 + DAY + 10),
            ],
            ..Default::default()
        },
        MemorySink::default(),
        200,
    )
    .await;

    let stats = HistoricalDriver::new(h.atlas.clone(), h.ingestor.clone(), T0, T0 + 2 * DAY, DAY)
        .with_now(T0 + 10 * DAY)
        .run(&[1001])
        .await
        .unwrap();

    assert_eq!(h.atlas.windows.lock().unwrap().len(), 2);
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.unresolved, 2);
    assert_eq!(stats.warnings_emitted, 1);
    assert_eq!(stats.indexed, 1);
}
