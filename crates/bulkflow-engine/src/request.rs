//! Ingestion request and result shapes
//!
//! These are the JSON documents a caller hands to the engine and gets back. Field names are
//! camelCase on the wire. [`IngestRequest::validate`] runs before any file is opened or any
//! request is sent.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::IngestError;
use crate::registry::JobStatus;
use crate::schema::TableKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Csv,
    Json,
    Api,
    Generator,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Csv => "csv",
            SourceType::Json => "json",
            SourceType::Api => "api",
            SourceType::Generator => "generator",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behaviour when a row collides with an existing key in the destination table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnConflict {
    /// Load straight into the table; a duplicate key fails the run
    #[default]
    Error,
    /// Load through a staging table and skip duplicates when merging
    Nothing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    /// Detect from the `.gz` extension or the gzip magic bytes
    Auto,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonMode {
    #[default]
    Array,
    Ndjson,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvOptions {
    pub file_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,
    #[serde(default)]
    pub compression: Compression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonOptions {
    #[serde(default)]
    pub mode: JsonMode,
    pub file_path: PathBuf,
    #[serde(default)]
    pub compression: Compression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiOptions {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Dot path to the record array; empty means the response body itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
    /// Dot path to the next page token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_request_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_pages: Option<u32>,
}

impl ApiOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: None,
            headers: BTreeMap::new(),
            body: None,
            timeout_ms: None,
            data_path: None,
            next_page_path: None,
            max_pages: None,
            min_request_interval_ms: None,
            parallel_pages: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorOptions {
    pub orders: u64,
    pub lines_per_order: u32,
    #[serde(default = "default_company_id")]
    pub company_id: i64,
    #[serde(default = "default_start_order_number")]
    pub start_order_number: i64,
}

fn default_company_id() -> i64 {
    1
}

fn default_start_order_number() -> i64 {
    1
}

impl GeneratorOptions {
    /// Order lines the options describe, `None` when the count does not fit a `u64`
    pub fn total_lines(&self) -> Option<u64> {
        self.orders.checked_mul(u64::from(self.lines_per_order))
    }

    /// Number of the last generated order, `None` when it does not fit an `i64`
    pub fn last_order_number(&self) -> Option<i64> {
        let offset = i64::try_from(self.orders.checked_sub(1)?).ok()?;
        self.start_order_number.checked_add(offset)
    }

    fn check(&self) -> Result<(), IngestError> {
        if self.orders == 0 {
            return Err(IngestError::Validation(
                "generator.orders must be greater than 0".into(),
            ));
        }
        let Some(lines) = self.total_lines() else {
            return Err(IngestError::Validation(format!(
                "generator.orders ({}) times generator.linesPerOrder ({}) is too large",
                self.orders, self.lines_per_order
            )));
        };
        if lines.checked_add(self.orders).is_none() {
            return Err(IngestError::Validation(format!(
                "generator would produce more than {} rows",
                u64::MAX
            )));
        }
        if self.last_order_number().is_none() {
            return Err(IngestError::Validation(format!(
                "generator order numbers starting at {} overflow after {} orders",
                self.start_order_number, self.orders
            )));
        }
        Ok(())
    }
}

/// Explicit source-key to column overrides, kept in the order the caller wrote them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMapping(Vec<(String, String)>);

impl SourceMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source_key: impl Into<String>, column: impl Into<String>) {
        self.0.push((source_key.into(), column.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SourceMapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Serialize for SourceMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, column) in &self.0 {
            map.serialize_entry(key, column)?;
        }
        map.end()
    }
}

struct SourceMappingVisitor;

impl<'de> Visitor<'de> for SourceMappingVisitor {
    type Value = SourceMapping;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("an object mapping source keys to column names")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, column)) = access.next_entry::<String, String>()? {
            entries.push((key, column));
        }
        Ok(SourceMapping(entries))
    }
}

impl<'de> Deserialize<'de> for SourceMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(SourceMappingVisitor)
    }
}

/// One ingestion run as requested by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub source_type: SourceType,
    pub table: String,
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default)]
    pub on_conflict: OnConflict,
    #[serde(default, skip_serializing_if = "SourceMapping::is_empty")]
    pub source_mapping: SourceMapping,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Persist and resume from checkpoints under `job_id`
    #[serde(default)]
    pub checkpoint: bool,
    #[serde(default)]
    pub dead_letter: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_dead_letters: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_heap_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv: Option<CsvOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<JsonOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<GeneratorOptions>,
}

impl IngestRequest {
    fn bare(source_type: SourceType, table: impl Into<String>) -> Self {
        Self {
            source_type,
            table: table.into(),
            strict_mode: false,
            on_conflict: OnConflict::Error,
            source_mapping: SourceMapping::new(),
            job_id: None,
            checkpoint: false,
            dead_letter: false,
            progress_interval: None,
            max_rows: None,
            max_duration_ms: None,
            max_dead_letters: None,
            max_heap_mb: None,
            csv: None,
            json: None,
            api: None,
            generator: None,
        }
    }

    pub fn csv(table: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            csv: Some(CsvOptions {
                file_path: file_path.into(),
                delimiter: None,
                compression: Compression::Auto,
            }),
            ..Self::bare(SourceType::Csv, table)
        }
    }

    pub fn json(table: impl Into<String>, file_path: impl Into<PathBuf>, mode: JsonMode) -> Self {
        Self {
            json: Some(JsonOptions {
                mode,
                file_path: file_path.into(),
                compression: Compression::Auto,
            }),
            ..Self::bare(SourceType::Json, table)
        }
    }

    pub fn api(table: impl Into<String>, options: ApiOptions) -> Self {
        Self {
            api: Some(options),
            ..Self::bare(SourceType::Api, table)
        }
    }

    pub fn generator(options: GeneratorOptions) -> Self {
        Self {
            generator: Some(options),
            ..Self::bare(SourceType::Generator, TableKind::Orders.table_name())
        }
    }

    /// Reject malformed requests before any I/O happens
    pub fn validate(&self) -> Result<TableKind, IngestError> {
        if self.table.trim().is_empty() {
            return Err(IngestError::Validation("table must not be empty".into()));
        }
        let table = TableKind::from_name(&self.table)?;

        if let Some(job_id) = &self.job_id {
            if job_id.trim().is_empty() {
                return Err(IngestError::Validation("jobId must not be empty".into()));
            }
        }
        if self.checkpoint && self.job_id.is_none() {
            return Err(IngestError::Validation(
                "checkpoint requires a jobId to resume under".into(),
            ));
        }

        for (name, value) in [
            ("progressInterval", self.progress_interval),
            ("maxRows", self.max_rows),
            ("maxDurationMs", self.max_duration_ms),
            ("maxHeapMb", self.max_heap_mb),
        ] {
            if value == Some(0) {
                return Err(IngestError::Validation(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        match self.source_type {
            SourceType::Csv => {
                let csv = self
                    .csv
                    .as_ref()
                    .ok_or_else(|| missing_block("csv"))?;
                require_path(&csv.file_path, "csv.filePath")?;
                if let Some(delimiter) = csv.delimiter {
                    if matches!(delimiter, '"' | '\n' | '\r') || !delimiter.is_ascii() {
                        return Err(IngestError::Validation(format!(
                            "unsupported delimiter {delimiter:?}"
                        )));
                    }
                }
            },
            SourceType::Json => {
                let json = self
                    .json
                    .as_ref()
                    .ok_or_else(|| missing_block("json"))?;
                require_path(&json.file_path, "json.filePath")?;
            },
            SourceType::Api => {
                let api = self.api.as_ref().ok_or_else(|| missing_block("api"))?;
                reqwest::Url::parse(&api.url).map_err(|e| {
                    IngestError::Validation(format!("api.url is not a valid URL: {e}"))
                })?;
                if let Some(method) = &api.method {
                    reqwest::Method::from_bytes(method.to_uppercase().as_bytes()).map_err(
                        |_| IngestError::Validation(format!("api.method {method:?} is invalid")),
                    )?;
                }
                for (name, value) in [
                    ("api.timeoutMs", api.timeout_ms),
                    ("api.maxPages", api.max_pages),
                    ("api.parallelPages", api.parallel_pages.map(u64::from)),
                ] {
                    if value == Some(0) {
                        return Err(IngestError::Validation(format!(
                            "{name} must be greater than 0"
                        )));
                    }
                }
            },
            SourceType::Generator => {
                let generator = self
                    .generator
                    .as_ref()
                    .ok_or_else(|| missing_block("generator"))?;
                if table != TableKind::Orders {
                    return Err(IngestError::Validation(
                        "the generator loads orders and their lines; table must be orders".into(),
                    ));
                }
                generator.check()?;
            },
        }

        Ok(table)
    }
}

fn missing_block(name: &str) -> IngestError {
    IngestError::Validation(format!("sourceType {name} requires a \"{name}\" block"))
}

fn require_path(path: &std::path::Path, field: &str) -> Result<(), IngestError> {
    if path.as_os_str().is_empty() {
        return Err(IngestError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Outcome of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub table: String,
    pub status: JobStatus,
    pub inserted_rows: u64,
    pub attempted_rows: u64,
    pub rejected_rows: u64,
    pub duration_ms: u64,
    pub rows_per_second: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_rows: Option<u64>,
}
