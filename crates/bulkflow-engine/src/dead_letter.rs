//! Dead letters for rejected records
//!
//! Rejected records are collected per run and written in batches, keyed by job id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::error::Result;

pub const DEFAULT_DEAD_LETTER_BATCH: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub job_id: String,
    /// 1-based position of the record in the source
    pub ordinal: u64,
    pub raw: Value,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn write(&self, records: &[DeadLetterRecord]) -> Result<()>;
}

/// Writes dead letters to `ingest_dead_letters`
#[derive(Debug, Clone)]
pub struct PgDeadLetterSink {
    pool: PgPool,
}

impl PgDeadLetterSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterSink {
    async fn write(&self, records: &[DeadLetterRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO ingest_dead_letters (job_id, ordinal, raw, reason, created_at) ",
        );
        builder.push_values(records, |mut row, record| {
            row.push_bind(&record.job_id)
                .push_bind(record.ordinal as i64)
                .push_bind(Json(&record.raw))
                .push_bind(&record.reason)
                .push_bind(record.created_at);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn write(&self, records: &[DeadLetterRecord]) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(records);
        Ok(())
    }
}

/// Batches one run's dead letters
pub struct DeadLetterWriter {
    sink: Arc<dyn DeadLetterSink>,
    job_id: String,
    pending: Vec<DeadLetterRecord>,
    batch_size: usize,
    written: u64,
}

impl DeadLetterWriter {
    pub fn new(sink: Arc<dyn DeadLetterSink>, job_id: impl Into<String>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            sink,
            job_id: job_id.into(),
            pending: Vec::with_capacity(batch_size),
            batch_size,
            written: 0,
        }
    }

    pub async fn push(&mut self, ordinal: u64, raw: Value, reason: &str) -> Result<()> {
        self.pending.push(DeadLetterRecord {
            job_id: self.job_id.clone(),
            ordinal,
            raw,
            reason: reason.to_string(),
            created_at: Utc::now(),
        });
        if self.pending.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.sink.write(&self.pending).await?;
        self.written += self.pending.len() as u64;
        debug!(job_id = %self.job_id, written = self.written, "Dead letters flushed");
        self.pending.clear();
        Ok(())
    }

    /// Records handed to the sink so far
    pub fn written(&self) -> u64 {
        self.written
    }
}
