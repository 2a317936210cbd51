//! Paginated HTTP API source
//!
//! Pages are requested one after another. Records come from `dataPath` in each response body
//! and the next page token from `nextPagePath`. A token that is an absolute URL is fetched
//! as-is, a token starting with `/` or `?` is resolved against the base URL, and anything else
//! is sent as the `cursor` query parameter.
//!
//! Server errors and network failures are retried with exponential backoff; client errors
//! fail at once. When `parallelPages > 1` the next page is requested while the current one is
//! being consumed.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::json::into_record;
use super::{Checkpoint, PageCallback, RawRecord, RecordSource, RetryPolicy, SourceContext, SourceRecord};
use crate::error::{IngestError, Result};
use crate::request::{ApiOptions, SourceType};

/// Follow a dot path (`data.items`, `pages.0.next`) into a JSON value
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn take_path(value: &mut Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(value.take());
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.take())
}

fn token_from(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// URL for the page identified by `cursor`
pub fn page_url(base: &Url, cursor: Option<&str>) -> Result<Url> {
    let Some(token) = cursor else {
        return Ok(base.clone());
    };
    if token.starts_with("http://") || token.starts_with("https://") {
        return Url::parse(token)
            .map_err(|e| IngestError::Source(format!("next page URL {token:?} is invalid: {e}")));
    }
    if token.starts_with('/') || token.starts_with('?') {
        return base
            .join(token)
            .map_err(|e| IngestError::Source(format!("next page path {token:?} is invalid: {e}")));
    }

    let mut url = base.clone();
    let retained: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != "cursor")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("cursor", token);
    Ok(url)
}

#[derive(Debug, Default)]
struct Page {
    records: Vec<Value>,
    next: Option<String>,
}

enum Attempt {
    Retryable(IngestError),
    Fatal(IngestError),
}

/// Spaces requests at least `interval` apart, across the reader and its prefetch task
#[derive(Clone)]
struct Throttle {
    interval: Duration,
    next_allowed: Arc<Mutex<Option<Instant>>>,
}

impl Throttle {
    async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let mut next_allowed = self.next_allowed.lock().await;
        if let Some(at) = *next_allowed {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(IngestError::Aborted),
                _ = tokio::time::sleep_until(at) => {},
            }
        }
        *next_allowed = Some(Instant::now() + self.interval);
        Ok(())
    }
}

#[derive(Clone)]
struct PageFetcher {
    client: reqwest::Client,
    method: Method,
    base_url: Url,
    headers: HeaderMap,
    body: Option<Value>,
    timeout: Duration,
    data_path: String,
    next_page_path: Option<String>,
    retry: RetryPolicy,
    throttle: Option<Throttle>,
    cancel: CancellationToken,
}

impl PageFetcher {
    async fn fetch(&self, cursor: Option<&str>) -> Result<Page> {
        let url = page_url(&self.base_url, cursor)?;
        let mut attempt = 0u32;
        loop {
            if let Some(throttle) = &self.throttle {
                throttle.wait(&self.cancel).await?;
            }
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(IngestError::Aborted),
                outcome = self.send(&url) => outcome,
            };
            match outcome {
                Ok(page) => {
                    debug!(%url, records = page.records.len(), "Fetched page");
                    return Ok(page);
                },
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retryable(e)) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        %url,
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Page request failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(IngestError::Aborted),
                        _ = tokio::time::sleep(delay) => {},
                    }
                },
                Err(Attempt::Retryable(e)) => return Err(e),
            }
        }
    }

    async fn send(&self, url: &Url) -> std::result::Result<Page, Attempt> {
        let mut request = self
            .client
            .request(self.method.clone(), url.clone())
            .headers(self.headers.clone())
            .timeout(self.timeout);
        if let Some(body) = &self.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Attempt::Retryable(e.into()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(Attempt::Retryable(IngestError::Source(format!(
                "{url} returned {status}"
            ))));
        }
        if !status.is_success() {
            return Err(Attempt::Fatal(IngestError::Source(format!(
                "{url} returned {status}"
            ))));
        }

        let mut body: Value = response.json().await.map_err(|e| {
            if e.is_decode() {
                Attempt::Fatal(e.into())
            } else {
                Attempt::Retryable(e.into())
            }
        })?;

        let next = self
            .next_page_path
            .as_deref()
            .and_then(|path| token_from(extract_path(&body, path)));
        let records = match take_path(&mut body, &self.data_path) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => {
                warn!(%url, data_path = %self.data_path, "No records at data path");
                Vec::new()
            },
            Some(single) => vec![single],
        };
        Ok(Page { records, next })
    }
}

/// Streams records from a paginated HTTP API
pub struct ApiReader {
    fetcher: PageFetcher,
    max_pages: Option<u64>,
    prefetch: bool,
    on_next_page: Option<PageCallback>,

    started: bool,
    start_cursor: Option<String>,
    start_page: u64,
    skip: u64,

    buffer: VecDeque<RawRecord>,
    page: u64,
    current_cursor: Option<String>,
    consumed_in_page: u64,
    next_cursor: Option<String>,
    seen_tokens: HashSet<String>,
    prefetched: Option<(Option<String>, JoinHandle<Result<Page>>)>,
}

impl ApiReader {
    pub fn new(options: &ApiOptions, ctx: SourceContext) -> Result<Self> {
        let base_url = Url::parse(&options.url)
            .map_err(|e| IngestError::Validation(format!("api.url is not a valid URL: {e}")))?;
        let method_name = options.method.as_deref().unwrap_or("GET").to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| IngestError::Validation(format!("api.method {method_name:?} is invalid")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| IngestError::Validation(format!("header {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| IngestError::Validation(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }

        let (start_cursor, start_page, skip) = match ctx.resume {
            None => (None, 0, 0),
            Some(Checkpoint::Page {
                cursor,
                page,
                offset,
            }) => (cursor, page, offset),
            Some(other) => {
                return Err(IngestError::Validation(format!(
                    "checkpoint {other:?} cannot resume an API source"
                )))
            },
        };

        let throttle = options
            .min_request_interval_ms
            .filter(|ms| *ms > 0)
            .map(|ms| Throttle {
                interval: Duration::from_millis(ms),
                next_allowed: Arc::new(Mutex::new(None)),
            });

        info!(
            url = %base_url,
            method = %method,
            resume_page = start_page,
            skip,
            "Opened API source"
        );

        Ok(Self {
            fetcher: PageFetcher {
                client: ctx.http,
                method,
                base_url,
                headers,
                body: options.body.clone(),
                timeout: options
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(ctx.default_timeout),
                data_path: options.data_path.clone().unwrap_or_default(),
                next_page_path: options.next_page_path.clone(),
                retry: ctx.retry,
                throttle,
                cancel: ctx.cancel,
            },
            max_pages: options.max_pages,
            prefetch: options.parallel_pages.unwrap_or(1) > 1,
            on_next_page: ctx.on_next_page,
            started: false,
            start_cursor,
            start_page,
            skip,
            buffer: VecDeque::new(),
            page: start_page,
            current_cursor: None,
            consumed_in_page: 0,
            next_cursor: None,
            seen_tokens: HashSet::new(),
            prefetched: None,
        })
    }

    fn within_page_limit(&self, page: u64) -> bool {
        self.max_pages.is_none_or(|max| page < max)
    }

    /// Fetch the following page into the buffer; `false` when there is none
    async fn load_next_page(&mut self) -> Result<bool> {
        let (cursor, page) = if self.started {
            match self.next_cursor.take() {
                Some(token) => (Some(token), self.page + 1),
                None => return Ok(false),
            }
        } else {
            self.started = true;
            (self.start_cursor.take(), self.start_page)
        };

        if !self.within_page_limit(page) {
            debug!(page, max_pages = ?self.max_pages, "Page limit reached");
            return Ok(false);
        }

        let fetched = match self.prefetched.take() {
            Some((prefetched_cursor, handle)) if prefetched_cursor == cursor => handle
                .await
                .map_err(|e| IngestError::Source(format!("page prefetch failed: {e}")))??,
            Some((_, stale)) => {
                stale.abort();
                self.fetcher.fetch(cursor.as_deref()).await?
            },
            None => self.fetcher.fetch(cursor.as_deref()).await?,
        };

        self.page = page;
        self.current_cursor = cursor;
        self.consumed_in_page = 0;
        self.next_cursor = None;

        if let Some(token) = fetched.next {
            if self.seen_tokens.insert(token.clone()) {
                if let Some(callback) = &self.on_next_page {
                    callback(&token);
                }
                self.next_cursor = Some(token);
            } else {
                warn!(token = %token, page, "Next page token repeats an earlier one, stopping");
            }
        }

        let mut records: VecDeque<RawRecord> = fetched.records.into_iter().map(into_record).collect();
        if self.skip > 0 {
            let skipped = (self.skip as usize).min(records.len());
            records.drain(..skipped);
            self.consumed_in_page = skipped as u64;
            self.skip = 0;
        }
        self.buffer = records;

        if self.prefetch {
            if let Some(next) = &self.next_cursor {
                if self.within_page_limit(page + 1) {
                    let fetcher = self.fetcher.clone();
                    let next = next.clone();
                    let cursor = Some(next.clone());
                    let handle = tokio::spawn(async move { fetcher.fetch(Some(&next)).await });
                    self.prefetched = Some((cursor, handle));
                }
            }
        }
        Ok(true)
    }
}

impl Drop for ApiReader {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.prefetched.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl RecordSource for ApiReader {
    fn source_type(&self) -> SourceType {
        SourceType::Api
    }

    async fn next_record(&mut self) -> Result<Option<SourceRecord>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                self.consumed_in_page += 1;
                let checkpoint = match (&self.next_cursor, self.buffer.is_empty()) {
                    (Some(next), true) => Checkpoint::Page {
                        cursor: Some(next.clone()),
                        page: self.page + 1,
                        offset: 0,
                    },
                    _ => Checkpoint::Page {
                        cursor: self.current_cursor.clone(),
                        page: self.page,
                        offset: self.consumed_in_page,
                    },
                };
                return Ok(Some(SourceRecord { record, checkpoint }));
            }
            if self.fetcher.cancel.is_cancelled() {
                return Err(IngestError::Aborted);
            }
            if !self.load_next_page().await? {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_path() {
        let body = json!({ "data": { "items": [1, 2] }, "pages": [{ "next": "p2" }] });
        assert_eq!(extract_path(&body, "data.items"), Some(&json!([1, 2])));
        assert_eq!(extract_path(&body, "pages.0.next"), Some(&json!("p2")));
        assert_eq!(extract_path(&body, "data.missing"), None);
        assert_eq!(extract_path(&body, ""), Some(&body));
    }

    #[test]
    fn test_take_path_moves_value_out() {
        let mut body = json!({ "data": [1, 2, 3], "next": "abc" });
        assert_eq!(take_path(&mut body, "data"), Some(json!([1, 2, 3])));
        assert_eq!(body["data"], Value::Null);
        assert_eq!(body["next"], "abc");
    }

    #[test]
    fn test_token_from() {
        assert_eq!(token_from(Some(&json!("  abc "))), Some("abc".into()));
        assert_eq!(token_from(Some(&json!(3))), Some("3".into()));
        assert_eq!(token_from(Some(&json!(""))), None);
        assert_eq!(token_from(Some(&json!(null))), None);
        assert_eq!(token_from(None), None);
    }

    #[test]
    fn test_page_url_forms() {
        let base = Url::parse("https://erp.example/api/orders?limit=100&cursor=old").unwrap();
        assert_eq!(page_url(&base, None).unwrap(), base);
        assert_eq!(
            page_url(&base, Some("abc")).unwrap().as_str(),
            "https://erp.example/api/orders?limit=100&cursor=abc"
        );
        assert_eq!(
            page_url(&base, Some("https://cdn.example/page/2")).unwrap().as_str(),
            "https://cdn.example/page/2"
        );
        assert_eq!(
            page_url(&base, Some("/api/orders?page=2")).unwrap().as_str(),
            "https://erp.example/api/orders?page=2"
        );
        assert_eq!(
            page_url(&base, Some("?page=3")).unwrap().as_str(),
            "https://erp.example/api/orders?page=3"
        );
    }
}
