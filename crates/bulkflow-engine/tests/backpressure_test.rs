//! Batch sizing under different sink pressure

mod common;

use bulkflow_engine::loader::{MemorySinkBehavior, MemorySinkFactory, Saturation};
use bulkflow_engine::{IngestEngine, IngestRequest, JobStatus};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use common::{init_test_tracing, orders_csv, small_config, write_fixture};

async fn load_with(behavior: MemorySinkBehavior, rows: u64) -> (IngestEngine, MemorySinkFactory) {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(dir.path(), "orders.csv", &orders_csv(1..=rows));
    let sinks = MemorySinkFactory::with_behavior(behavior);
    let engine = IngestEngine::builder(small_config())
        .sinks(Arc::new(sinks.clone()))
        .build()
        .unwrap();

    let result = engine
        .run(IngestRequest::csv("orders", &path))
        .await
        .unwrap();
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.inserted_rows, rows);
    (engine, sinks)
}

#[tokio::test]
async fn test_target_grows_without_pressure() {
    init_test_tracing();
    let (engine, sinks) = load_with(MemorySinkBehavior::default(), 600).await;

    let batch = engine.metrics().last_run().unwrap().batch;
    assert_eq!(batch.stalls, 0);
    assert!(batch.target_rows > 16, "target stayed at {}", batch.target_rows);
    assert_eq!(sinks.table("orders").unwrap().loads, 1);
}

#[tokio::test]
async fn test_target_shrinks_when_every_chunk_stalls() {
    init_test_tracing();
    let (engine, _sinks) = load_with(
        MemorySinkBehavior {
            saturation: Saturation::Always,
            ..MemorySinkBehavior::default()
        },
        600,
    )
    .await;

    let batch = engine.metrics().last_run().unwrap().batch;
    assert!(batch.stalls > 10, "only {} stalls", batch.stalls);
    assert_eq!(batch.stalls, batch.chunks_written);
    assert!(batch.target_rows < 16, "target stayed at {}", batch.target_rows);
    assert!(batch.target_rows >= 2);
}

#[tokio::test]
async fn test_intermittent_pressure_loses_no_rows() {
    init_test_tracing();
    let (engine, sinks) = load_with(
        MemorySinkBehavior {
            saturation: Saturation::EveryNth(3),
            drain_delay: Duration::from_millis(1),
            ..MemorySinkBehavior::default()
        },
        400,
    )
    .await;

    let batch = engine.metrics().last_run().unwrap().batch;
    assert!(batch.stalls > 0);
    assert!(batch.stall_wait_ms <= batch.stalls * 1_000);

    let table = sinks.table("orders").unwrap();
    let ordrenr = table.columns.iter().position(|c| c == "ordrenr").unwrap();
    let numbers: Vec<u64> = table
        .rows
        .iter()
        .map(|row| row[ordrenr].as_deref().unwrap().parse().unwrap())
        .collect();
    assert_eq!(numbers, (1..=400).collect::<Vec<_>>());
}
