//! Paginated API ingestion against a mock server

mod common;

use bulkflow_engine::loader::MemorySinkFactory;
use bulkflow_engine::request::ApiOptions;
use bulkflow_engine::source::api::ApiReader;
use bulkflow_engine::source::{Checkpoint, PageCallback, RecordSource, RetryPolicy, SourceContext};
use bulkflow_engine::{IngestEngine, IngestError, IngestRequest, JobStatus};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{init_test_tracing, small_config};

fn engine(sinks: &MemorySinkFactory) -> IngestEngine {
    IngestEngine::builder(small_config())
        .sinks(Arc::new(sinks.clone()))
        .build()
        .unwrap()
}

async fn two_page_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(query_param_is_missing("cursor"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "items": [
                { "OrdreNr": 1, "Kunde Nr": 10, "Sum": "1.234,50" },
                { "OrdreNr": 2, "Kunde Nr": 11, "Sum": "99,90" }
            ]},
            "paging": { "next": "p2" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(query_param("cursor", "p2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "items": [{ "OrdreNr": 3, "Kunde Nr": 12, "Sum": "5" }] },
            "paging": { "next": null }
        })))
        .mount(&server)
        .await;
    server
}

fn orders_request(server: &MockServer) -> IngestRequest {
    let mut options = ApiOptions::new(format!("{}/orders", server.uri()));
    options.data_path = Some("data.items".into());
    options.next_page_path = Some("paging.next".into());
    IngestRequest::api("orders", options)
}

#[tokio::test]
async fn test_follows_next_page_tokens() {
    init_test_tracing();
    let server = two_page_server().await;
    let sinks = MemorySinkFactory::new();
    let engine = engine(&sinks);
    let mut request = orders_request(&server);
    request.job_id = Some("api-orders".into());

    let result = engine.run(request).await.unwrap();
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.inserted_rows, 3);

    let table = sinks.table("orders").unwrap();
    let ordrenr = table.columns.iter().position(|c| c == "ordrenr").unwrap();
    let sum = table.columns.iter().position(|c| c == "sum").unwrap();
    let numbers: Vec<_> = table.rows.iter().map(|r| r[ordrenr].clone().unwrap()).collect();
    assert_eq!(numbers, vec!["1", "2", "3"]);
    assert_eq!(table.rows[0][sum].as_deref(), Some("1234.5"));

    let job = engine.registry().get("api-orders").unwrap();
    assert_eq!(job.last_cursor.as_deref(), Some("p2"));
}

#[tokio::test]
async fn test_sends_configured_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/customers"))
        .and(header("x-api-key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "kundenr": 7, "navn": "Ola Nordmann" }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let sinks = MemorySinkFactory::new();
    let mut options = ApiOptions::new(format!("{}/customers", server.uri()));
    options
        .headers
        .insert("x-api-key".into(), "secret".into());

    let result = engine(&sinks)
        .run(IngestRequest::api("customers", options))
        .await
        .unwrap();
    assert_eq!(result.inserted_rows, 1);
    assert_eq!(sinks.rows("customers").len(), 1);
}

#[tokio::test]
async fn test_retries_server_errors() {
    init_test_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/products"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/products"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{ "varekode": "V-1", "pris": "10,00" }, { "varekode": "V-2", "pris": "12,50" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sinks = MemorySinkFactory::new();
    let mut options = ApiOptions::new(format!("{}/products", server.uri()));
    options.data_path = Some("items".into());

    let result = engine(&sinks)
        .run(IngestRequest::api("products", options))
        .await
        .unwrap();
    assert_eq!(result.inserted_rows, 2);
}

#[tokio::test]
async fn test_client_error_fails_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let sinks = MemorySinkFactory::new();
    let failure = engine(&sinks)
        .run(orders_request(&server))
        .await
        .unwrap_err();
    assert_eq!(failure.error.category(), "source");
    assert_eq!(failure.result.status, JobStatus::Failed);
    assert_eq!(failure.result.attempted_rows, 0);
}

#[tokio::test]
async fn test_resumes_from_page_checkpoint() {
    init_test_tracing();
    let server = two_page_server().await;
    let sinks = MemorySinkFactory::new();
    let engine = engine(&sinks);

    let mut request = orders_request(&server);
    request.job_id = Some("api-resume".into());
    request.checkpoint = true;
    request.max_rows = Some(2);

    let failure = engine.run(request.clone()).await.unwrap_err();
    assert_eq!(failure.error.category(), "max-rows-exceeded");
    assert_eq!(failure.result.inserted_rows, 2);
    let job = engine.registry().get("api-resume").unwrap();
    assert_eq!(
        job.checkpoint,
        Some(Checkpoint::Page {
            cursor: Some("p2".into()),
            page: 1,
            offset: 0
        })
    );

    request.max_rows = None;
    let result = engine.run(request).await.unwrap();
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.inserted_rows, 1);

    let table = sinks.table("orders").unwrap();
    let ordrenr = table.columns.iter().position(|c| c == "ordrenr").unwrap();
    let numbers: Vec<_> = table.rows.iter().map(|r| r[ordrenr].clone().unwrap()).collect();
    assert_eq!(numbers, vec!["1", "2", "3"]);
}

/// `/events` with `pages` pages of two records each, chained by `cursor=pN` tokens
async fn chained_server(pages: u32) -> MockServer {
    let server = MockServer::start().await;
    for page in 1..=pages {
        let next = (page < pages).then(|| format!("p{}", page + 1));
        let body = json!({
            "items": [
                { "kundenr": page * 10 + 1, "navn": format!("Kunde {page}a") },
                { "kundenr": page * 10 + 2, "navn": format!("Kunde {page}b") }
            ],
            "next": next
        });
        let mock = Mock::given(method("GET")).and(path("/events"));
        let mock = if page == 1 {
            mock.and(query_param_is_missing("cursor"))
        } else {
            mock.and(query_param("cursor", format!("p{page}").as_str()))
        };
        mock.respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
    }
    server
}

fn customers_options(server: &MockServer) -> ApiOptions {
    let mut options = ApiOptions::new(format!("{}/events", server.uri()));
    options.data_path = Some("items".into());
    options.next_page_path = Some("next".into());
    options
}

fn reader_context(cancel: CancellationToken, on_next_page: Option<PageCallback>) -> SourceContext {
    SourceContext {
        cancel,
        resume: None,
        retry: RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(10),
        },
        default_timeout: Duration::from_secs(10),
        http: reqwest::Client::new(),
        on_next_page,
    }
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap().len()
}

#[tokio::test]
async fn test_prefetches_next_page_and_reports_each_token_once() {
    init_test_tracing();
    let server = chained_server(3).await;
    let mut options = customers_options(&server);
    options.parallel_pages = Some(2);

    let tokens = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder: PageCallback = {
        let tokens = tokens.clone();
        Arc::new(move |token: &str| tokens.lock().unwrap().push(token.to_string()))
    };
    let mut reader =
        ApiReader::new(&options, reader_context(CancellationToken::new(), Some(recorder))).unwrap();

    // Page 2 is requested while page 1 is still being consumed
    let first = reader.next_record().await.unwrap().unwrap();
    assert_eq!(first.record["kundenr"], 11);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(request_count(&server).await, 2);

    let mut total = 1;
    while reader.next_record().await.unwrap().is_some() {
        total += 1;
    }
    assert_eq!(total, 6);
    assert_eq!(request_count(&server).await, 3);
    assert_eq!(*tokens.lock().unwrap(), vec!["p2", "p3"]);
}

#[tokio::test]
async fn test_stops_at_max_pages() {
    let server = chained_server(5).await;
    let sinks = MemorySinkFactory::new();
    let mut options = customers_options(&server);
    options.max_pages = Some(2);
    options.parallel_pages = Some(2);

    let result = engine(&sinks)
        .run(IngestRequest::api("customers", options))
        .await
        .unwrap();
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.inserted_rows, 4);
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn test_spaces_requests_by_min_interval() {
    let server = chained_server(3).await;
    let sinks = MemorySinkFactory::new();
    let mut options = customers_options(&server);
    options.min_request_interval_ms = Some(150);

    let started = Instant::now();
    let result = engine(&sinks)
        .run(IngestRequest::api("customers", options))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.inserted_rows, 6);
    assert_eq!(request_count(&server).await, 3);
    assert!(
        elapsed >= Duration::from_millis(300),
        "three requests finished in {elapsed:?}"
    );
}

#[tokio::test]
async fn test_cancel_interrupts_in_flight_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "kundenr": 1 }]))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let options = ApiOptions::new(format!("{}/slow", server.uri()));
    let mut reader = ApiReader::new(&options, reader_context(cancel.clone(), None)).unwrap();

    let trigger = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    };
    let (outcome, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(reader.next_record(), trigger)
    })
    .await
    .expect("cancellation should not wait for the response");
    assert!(matches!(outcome, Err(IngestError::Aborted)));
}

#[tokio::test]
async fn test_cancelling_job_during_request_reports_cancelled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "kundenr": 1 }]))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    let sinks = MemorySinkFactory::new();
    let engine = engine(&sinks);
    let mut request =
        IngestRequest::api("customers", ApiOptions::new(format!("{}/slow", server.uri())));
    request.job_id = Some("slow-api".into());

    let trigger = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(engine.cancel("slow-api"));
    };
    let (outcome, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(engine.run(request), trigger)
    })
    .await
    .expect("cancellation should not wait for the response");

    let result = outcome.unwrap();
    assert_eq!(result.status, JobStatus::Cancelled);
    assert_eq!(result.inserted_rows, 0);
    assert_eq!(
        engine.registry().get("slow-api").unwrap().status,
        JobStatus::Cancelled
    );
}
