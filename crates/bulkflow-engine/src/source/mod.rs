//! Record sources
//!
//! A source yields loosely-typed key/value records one at a time. Each record carries the
//! [`Checkpoint`] that becomes valid once the record has been consumed, so a run that stops
//! after any record can resume right after it.
//!
//! File sources decode on a blocking task and hand records over a bounded channel; the API
//! source drives its own requests; the generator computes records on the fly.

pub mod api;
pub mod compression;
pub mod delimited;
pub mod generator;
pub mod json;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{IngestError, Result};
use crate::request::{IngestRequest, SourceType};
use crate::schema::TableKind;

/// One source record, before any transformation
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Resume position within a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Checkpoint {
    /// Byte offset into the decoded stream, just past the last consumed record
    ByteOffset { offset: u64 },
    /// Number of records consumed
    Ordinal { records: u64 },
    /// Page to fetch next and how many of its records were already consumed
    Page {
        cursor: Option<String>,
        page: u64,
        offset: u64,
    },
}

impl Checkpoint {
    /// Whether `self` lies strictly beyond `other`.
    ///
    /// Checkpoints of different kinds are not comparable and never count as ahead.
    pub fn is_ahead_of(&self, other: &Checkpoint) -> bool {
        match (self, other) {
            (Checkpoint::ByteOffset { offset: a }, Checkpoint::ByteOffset { offset: b }) => a > b,
            (Checkpoint::Ordinal { records: a }, Checkpoint::Ordinal { records: b }) => a > b,
            (
                Checkpoint::Page {
                    page: pa,
                    offset: oa,
                    ..
                },
                Checkpoint::Page {
                    page: pb,
                    offset: ob,
                    ..
                },
            ) => (pa, oa) > (pb, ob),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub record: RawRecord,
    pub checkpoint: Checkpoint,
}

/// Lazy, finite sequence of raw records
#[async_trait]
pub trait RecordSource: Send {
    fn source_type(&self) -> SourceType;

    /// Field names known before the first record (delimited headers)
    fn declared_keys(&self) -> Option<&[String]> {
        None
    }

    /// Next record, `Ok(None)` once the source is exhausted.
    ///
    /// Cancellation of the job surfaces as [`IngestError::Aborted`].
    async fn next_record(&mut self) -> Result<Option<SourceRecord>>;
}

/// Callback invoked once per discovered next-page token
pub type PageCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Retry policy for remote sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Everything a source needs from the running job
#[derive(Clone)]
pub struct SourceContext {
    pub cancel: CancellationToken,
    pub resume: Option<Checkpoint>,
    pub retry: RetryPolicy,
    pub default_timeout: Duration,
    pub http: reqwest::Client,
    pub on_next_page: Option<PageCallback>,
}

/// Open the source described by a request
pub async fn open_source(request: &IngestRequest, ctx: SourceContext) -> Result<Box<dyn RecordSource>> {
    match request.source_type {
        SourceType::Csv => {
            let options = request
                .csv
                .as_ref()
                .ok_or_else(|| IngestError::Validation("missing csv block".into()))?;
            let reader = delimited::DelimitedReader::open(options, ctx).await?;
            Ok(Box::new(reader))
        },
        SourceType::Json => {
            let options = request
                .json
                .as_ref()
                .ok_or_else(|| IngestError::Validation("missing json block".into()))?;
            Ok(Box::new(json::JsonReader::open(options, ctx)?))
        },
        SourceType::Api => {
            let options = request
                .api
                .as_ref()
                .ok_or_else(|| IngestError::Validation("missing api block".into()))?;
            Ok(Box::new(api::ApiReader::new(options, ctx)?))
        },
        SourceType::Generator => {
            let options = request
                .generator
                .as_ref()
                .ok_or_else(|| IngestError::Validation("missing generator block".into()))?;
            Ok(Box::new(generator::GeneratorSource::new(
                options,
                TableKind::Orders,
                ctx.cancel,
            )?))
        },
    }
}

type Item = Result<SourceRecord>;

/// Sending half handed to blocking producers
pub(crate) struct Producer {
    tx: mpsc::Sender<Item>,
}

impl Producer {
    /// Hand one record to the consumer; `false` once the consumer is gone
    pub(crate) fn emit(&self, record: RawRecord, checkpoint: Checkpoint) -> bool {
        self.tx
            .blocking_send(Ok(SourceRecord { record, checkpoint }))
            .is_ok()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of a blocking producer task
pub(crate) struct ChannelSource {
    source_type: SourceType,
    declared_keys: Option<Vec<String>>,
    rx: mpsc::Receiver<Item>,
    task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ChannelSource {
    /// Run `produce` on the blocking pool; an error it returns becomes the final item
    pub(crate) fn spawn<F>(
        source_type: SourceType,
        declared_keys: Option<Vec<String>>,
        capacity: usize,
        cancel: CancellationToken,
        produce: F,
    ) -> Self
    where
        F: FnOnce(&Producer) -> Result<()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::task::spawn_blocking(move || {
            let producer = Producer { tx };
            if let Err(e) = produce(&producer) {
                let _ = producer.tx.blocking_send(Err(e));
            }
        });
        Self {
            source_type,
            declared_keys,
            rx,
            task: Some(task),
            cancel,
        }
    }
}

#[async_trait]
impl RecordSource for ChannelSource {
    fn source_type(&self) -> SourceType {
        self.source_type
    }

    fn declared_keys(&self) -> Option<&[String]> {
        self.declared_keys.as_deref()
    }

    async fn next_record(&mut self) -> Result<Option<SourceRecord>> {
        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(IngestError::Aborted),
            item = self.rx.recv() => item,
        };
        match item {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(e),
            None => {
                // Channel closed: either the producer finished or it panicked
                if let Some(task) = self.task.take() {
                    task.await.map_err(|e| {
                        IngestError::Source(format!("reader task failed: {e}"))
                    })?;
                }
                Ok(None)
            },
        }
    }
}
