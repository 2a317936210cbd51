//! Delimited-text source (CSV and semicolon-separated exports)

use async_trait::async_trait;
use serde_json::Value;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::compression::{is_gzip, open_at};
use super::{ChannelSource, Checkpoint, Producer, RawRecord, RecordSource, SourceContext, SourceRecord};
use crate::error::{IngestError, Result};
use crate::request::{CsvOptions, SourceType};
use crate::transform::normalize_key;

const CHANNEL_CAPACITY: usize = 1024;

/// Pick `;` when the header line has more semicolons than commas, else `,`
pub fn detect_delimiter(first_line: &str) -> u8 {
    let semicolons = first_line.matches(';').count();
    let commas = first_line.matches(',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

#[derive(Debug)]
struct Header {
    keys: Vec<String>,
    delimiter: u8,
    gzip: bool,
    /// Decoded bytes taken by the header line
    length: u64,
}

fn read_header(path: &Path, options: &CsvOptions) -> Result<Header> {
    let gzip = is_gzip(path, options.compression)?;
    let mut reader = open_at(path, gzip, 0)?;
    let mut line = Vec::new();
    let length = reader.read_until(b'\n', &mut line)? as u64;
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }

    let text = String::from_utf8_lossy(&line);
    let delimiter = match options.delimiter {
        Some(c) => c as u8,
        None => detect_delimiter(&text),
    };

    let mut header_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter)
        .from_reader(line.as_slice());
    let mut fields = csv::ByteRecord::new();
    header_reader.read_byte_record(&mut fields)?;
    let keys = fields
        .iter()
        .map(|field| normalize_key(&String::from_utf8_lossy(field)))
        .collect();

    Ok(Header {
        keys,
        delimiter,
        gzip,
        length,
    })
}

fn stream_rows(
    path: &Path,
    header: &Header,
    start: u64,
    producer: &Producer,
) -> Result<()> {
    let reader = open_at(path, header.gzip, start)?;
    let mut rows = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(header.delimiter)
        .from_reader(reader);

    let mut row = csv::ByteRecord::new();
    let mut emitted = 0u64;
    while rows.read_byte_record(&mut row)? {
        let offset = start + rows.position().byte();
        let mut record = RawRecord::new();
        for (key, field) in header.keys.iter().zip(row.iter()) {
            record.insert(
                key.clone(),
                Value::String(String::from_utf8_lossy(field).into_owned()),
            );
        }
        if !producer.emit(record, Checkpoint::ByteOffset { offset }) {
            debug!(emitted, "Consumer went away, stopping delimited reader");
            return Ok(());
        }
        emitted += 1;
    }
    debug!(emitted, path = %path.display(), "Delimited reader finished");
    Ok(())
}

/// Streams records from a delimited file; headers are read before the first record
pub struct DelimitedReader {
    inner: ChannelSource,
}

impl DelimitedReader {
    pub async fn open(options: &CsvOptions, ctx: SourceContext) -> Result<Self> {
        let resume = match ctx.resume {
            None => None,
            Some(Checkpoint::ByteOffset { offset }) => Some(offset),
            Some(other) => {
                return Err(IngestError::Validation(format!(
                    "checkpoint {other:?} cannot resume a delimited file"
                )))
            },
        };

        let path: PathBuf = options.file_path.clone();
        let header = {
            let path = path.clone();
            let options = options.clone();
            tokio::task::spawn_blocking(move || read_header(&path, &options))
                .await
                .map_err(|e| IngestError::Source(format!("header reader failed: {e}")))??
        };

        let start = resume.map_or(header.length, |offset| offset.max(header.length));
        info!(
            path = %path.display(),
            columns = header.keys.len(),
            delimiter = %(header.delimiter as char),
            gzip = header.gzip,
            start,
            "Opened delimited source"
        );

        let keys = header.keys.clone();
        let inner = ChannelSource::spawn(
            SourceType::Csv,
            Some(keys),
            CHANNEL_CAPACITY,
            ctx.cancel,
            move |producer| {
                if header.keys.is_empty() {
                    return Ok(());
                }
                stream_rows(&path, &header, start, producer)
            },
        );
        Ok(Self { inner })
    }
}

#[async_trait]
impl RecordSource for DelimitedReader {
    fn source_type(&self) -> SourceType {
        SourceType::Csv
    }

    fn declared_keys(&self) -> Option<&[String]> {
        self.inner.declared_keys()
    }

    async fn next_record(&mut self) -> Result<Option<SourceRecord>> {
        self.inner.next_record().await
    }
}
