//! Durable log of failed runs
//!
//! The registry keeps jobs in memory only; the failure summary of every failed run is also
//! appended here so it outlives the process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::{Mutex, PoisonError};

use crate::error::{IngestError, Result};
use crate::registry::JobCounts;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub job_id: String,
    pub table_name: String,
    pub category: String,
    pub reason: String,
    pub attempted: i64,
    pub inserted: i64,
    pub rejected: i64,
    pub occurred_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(job_id: &str, table: &str, error: &IngestError, counts: JobCounts) -> Self {
        Self {
            job_id: job_id.to_string(),
            table_name: table.to_string(),
            category: error.category().to_string(),
            reason: error.to_string(),
            attempted: counts.attempted as i64,
            inserted: counts.inserted as i64,
            rejected: counts.rejected as i64,
            occurred_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait FailureLog: Send + Sync {
    async fn append(&self, record: &FailureRecord) -> Result<()>;

    /// Most recent failure recorded for `job_id`
    async fn last_for(&self, job_id: &str) -> Result<Option<FailureRecord>>;
}

/// Failure log stored in `ingest_failures`
#[derive(Debug, Clone)]
pub struct PgFailureLog {
    pool: PgPool,
}

impl PgFailureLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FailureLog for PgFailureLog {
    async fn append(&self, record: &FailureRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_failures
                (job_id, table_name, category, reason, attempted, inserted, rejected, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.job_id)
        .bind(&record.table_name)
        .bind(&record.category)
        .bind(&record.reason)
        .bind(record.attempted)
        .bind(record.inserted)
        .bind(record.rejected)
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_for(&self, job_id: &str) -> Result<Option<FailureRecord>> {
        let record = sqlx::query_as::<_, FailureRecord>(
            r#"
            SELECT job_id, table_name, category, reason, attempted, inserted, rejected, occurred_at
            FROM ingest_failures
            WHERE job_id = $1
            ORDER BY occurred_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}

/// In-process failure log for dry runs and tests
#[derive(Debug, Default)]
pub struct MemoryFailureLog {
    records: Mutex<Vec<FailureRecord>>,
}

impl MemoryFailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FailureRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl FailureLog for MemoryFailureLog {
    async fn append(&self, record: &FailureRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    async fn last_for(&self, job_id: &str) -> Result<Option<FailureRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|r| r.job_id == job_id)
            .cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::LimitKind;

    #[tokio::test]
    async fn test_memory_log_returns_latest_for_job() {
        let log = MemoryFailureLog::new();
        let counts = JobCounts {
            attempted: 10,
            inserted: 7,
            rejected: 3,
        };
        log.append(&FailureRecord::new(
            "j1",
            "orders",
            &IngestError::Source("first".into()),
            counts,
        ))
        .await
        .unwrap();
        log.append(&FailureRecord::new(
            "j2",
            "orders",
            &IngestError::Source("other job".into()),
            counts,
        ))
        .await
        .unwrap();
        log.append(&FailureRecord::new(
            "j1",
            "orders",
            &IngestError::limit(LimitKind::MaxRows, "reached 10 rows"),
            counts,
        ))
        .await
        .unwrap();

        let last = log.last_for("j1").await.unwrap().unwrap();
        assert_eq!(last.category, "max-rows-exceeded");
        assert_eq!(last.attempted, 10);
        assert!(log.last_for("missing").await.unwrap().is_none());
    }
}
