//! Cancelling a checkpointed run and resuming it under the same job id

mod common;

use bulkflow_engine::loader::{MemorySinkBehavior, MemorySinkFactory, Saturation};
use bulkflow_engine::{IngestEngine, IngestRequest, JobEvent, JobStatus};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use common::{init_test_tracing, orders_csv, small_config, write_fixture};

const JOB_ID: &str = "nightly-orders";

fn slow_sinks() -> MemorySinkFactory {
    MemorySinkFactory::with_behavior(MemorySinkBehavior {
        saturation: Saturation::Always,
        drain_delay: Duration::from_millis(2),
        ..MemorySinkBehavior::default()
    })
}

fn committed_order_numbers(sinks: &MemorySinkFactory) -> Vec<String> {
    let table = sinks.table("orders").unwrap();
    let ordrenr = table.columns.iter().position(|c| c == "ordrenr").unwrap();
    table
        .rows
        .iter()
        .map(|row| row[ordrenr].clone().unwrap())
        .collect()
}

#[tokio::test]
async fn test_cancel_then_resume_loads_every_row_once() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let path = write_fixture(dir.path(), "orders.csv", &orders_csv(1..=600));
    let sinks = slow_sinks();
    let engine = IngestEngine::builder(small_config())
        .sinks(Arc::new(sinks.clone()))
        .build()
        .unwrap();

    let mut request = IngestRequest::csv("orders", &path);
    request.job_id = Some(JOB_ID.into());
    request.checkpoint = true;
    request.progress_interval = Some(25);

    let registry = Arc::clone(engine.registry());
    let mut events = registry.subscribe(Some(JOB_ID));
    let canceller = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                JobEvent::Progress { attempted, .. } if attempted >= 100 => {
                    registry.cancel(JOB_ID);
                    break;
                },
                JobEvent::Finished { .. } => break,
                _ => {},
            }
        }
    });

    let first = engine.run(request.clone()).await.unwrap();
    canceller.await.unwrap();
    assert_eq!(first.status, JobStatus::Cancelled);
    assert!(first.inserted_rows >= 100 && first.inserted_rows < 600);
    assert_eq!(first.attempted_rows, first.inserted_rows + first.rejected_rows);

    let job = engine.registry().get(JOB_ID).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    let checkpoint = job.checkpoint.clone().unwrap();

    let second = engine.run(request).await.unwrap();
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(first.inserted_rows + second.inserted_rows, 600);

    let resumed = engine.registry().get(JOB_ID).unwrap();
    assert_eq!(resumed.resumed_from, Some(checkpoint));

    let numbers = committed_order_numbers(&sinks);
    let unique: HashSet<_> = numbers.iter().collect();
    assert_eq!(numbers.len(), 600);
    assert_eq!(unique.len(), 600);
}

#[tokio::test]
async fn test_without_checkpointing_rerun_starts_over() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(dir.path(), "orders.csv", &orders_csv(1..=40));
    let sinks = MemorySinkFactory::new();
    let engine = IngestEngine::builder(small_config())
        .sinks(Arc::new(sinks.clone()))
        .build()
        .unwrap();

    let mut request = IngestRequest::csv("orders", &path);
    request.job_id = Some("adhoc".into());
    request.max_rows = Some(10);
    let failure = engine.run(request.clone()).await.unwrap_err();
    assert_eq!(failure.result.inserted_rows, 10);
    assert!(engine.registry().get("adhoc").unwrap().checkpoint.is_none());

    request.max_rows = None;
    let result = engine.run(request).await.unwrap();
    assert_eq!(result.inserted_rows, 40);
    assert_eq!(committed_order_numbers(&sinks).len(), 50);
}

#[tokio::test]
async fn test_registry_lists_runs_most_recent_first() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(dir.path(), "orders.csv", &orders_csv(1..=5));
    let engine = IngestEngine::builder(small_config()).build().unwrap();

    for id in ["first", "second", "third"] {
        let mut request = IngestRequest::csv("orders", &path);
        request.job_id = Some(id.into());
        engine.run(request).await.unwrap();
    }

    let ids: Vec<_> = engine
        .registry()
        .list()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(ids, vec!["third", "second", "first"]);
    assert_eq!(engine.metrics().last_run().unwrap().job_id, "third");
}
