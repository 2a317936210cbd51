//! JSON sources: one top-level array, or one value per line

use async_trait::async_trait;
use serde::de::{self, IgnoredAny, SeqAccess, Visitor};
use serde::Deserializer as _;
use serde_json::Value;
use std::fmt;
use std::io::BufRead;
use std::path::Path;
use tracing::{debug, info};

use super::compression::{is_gzip, open_at};
use super::{ChannelSource, Checkpoint, Producer, RawRecord, RecordSource, SourceContext, SourceRecord};
use crate::error::{IngestError, Result};
use crate::request::{JsonMode, JsonOptions, SourceType};

const CHANNEL_CAPACITY: usize = 1024;

/// Objects pass through; any other value becomes `{ "value": <v> }`
pub fn into_record(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        other => {
            let mut record = RawRecord::new();
            record.insert("value".to_string(), other);
            record
        },
    }
}

struct ArrayStream<'a> {
    producer: &'a Producer,
    skip: u64,
}

impl<'de> Visitor<'de> for ArrayStream<'_> {
    type Value = u64;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a top-level JSON array")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<u64, A::Error> {
        let mut index = 0u64;
        while index < self.skip {
            if seq.next_element::<IgnoredAny>()?.is_none() {
                return Ok(index);
            }
            index += 1;
        }
        while let Some(value) = seq.next_element::<Value>()? {
            index += 1;
            if !self
                .producer
                .emit(into_record(value), Checkpoint::Ordinal { records: index })
            {
                return Err(de::Error::custom("consumer stopped"));
            }
        }
        Ok(index)
    }
}

fn stream_array(path: &Path, gzip: bool, skip: u64, producer: &Producer) -> Result<()> {
    let reader = open_at(path, gzip, 0)?;
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    match (&mut deserializer).deserialize_seq(ArrayStream { producer, skip }) {
        Ok(count) => {
            deserializer.end()?;
            debug!(count, path = %path.display(), "JSON array exhausted");
            Ok(())
        },
        Err(_) if producer.is_closed() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn stream_lines(path: &Path, gzip: bool, start: u64, producer: &Producer) -> Result<()> {
    let mut reader = open_at(path, gzip, start)?;
    let mut offset = start;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            return Ok(());
        }
        let line_start = offset;
        offset += read as u64;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(trimmed).map_err(|e| {
            IngestError::Source(format!(
                "malformed JSON line at byte {line_start} of {}: {e}",
                path.display()
            ))
        })?;
        if !producer.emit(into_record(value), Checkpoint::ByteOffset { offset }) {
            return Ok(());
        }
    }
}

/// Streams records from a JSON array or NDJSON file
pub struct JsonReader {
    inner: ChannelSource,
}

impl JsonReader {
    pub fn open(options: &JsonOptions, ctx: SourceContext) -> Result<Self> {
        let path = options.file_path.clone();
        let compression = options.compression;
        let mode = options.mode;

        let resume = match (mode, ctx.resume) {
            (_, None) => 0,
            (JsonMode::Array, Some(Checkpoint::Ordinal { records })) => records,
            (JsonMode::Ndjson, Some(Checkpoint::ByteOffset { offset })) => offset,
            (_, Some(other)) => {
                return Err(IngestError::Validation(format!(
                    "checkpoint {other:?} cannot resume a {mode:?} JSON source"
                )))
            },
        };
        info!(path = %path.display(), ?mode, resume, "Opened JSON source");

        let inner = ChannelSource::spawn(
            SourceType::Json,
            None,
            CHANNEL_CAPACITY,
            ctx.cancel,
            move |producer| {
                let gzip = is_gzip(&path, compression)?;
                match mode {
                    JsonMode::Array => stream_array(&path, gzip, resume, producer),
                    JsonMode::Ndjson => stream_lines(&path, gzip, resume, producer),
                }
            },
        );
        Ok(Self { inner })
    }
}

#[async_trait]
impl RecordSource for JsonReader {
    fn source_type(&self) -> SourceType {
        SourceType::Json
    }

    async fn next_record(&mut self) -> Result<Option<SourceRecord>> {
        self.inner.next_record().await
    }
}
