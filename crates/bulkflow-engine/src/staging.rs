//! Staging tables for the fast bulk path
//!
//! Rows are copied into an unlogged `ingest_staging_<table>_<run>` first and moved into the
//! final table in one transaction, skipping rows whose key already exists. Every load gets its
//! own staging table, dropped in the merge transaction or when the load gives up. Moves are
//! serialized by an in-process lock plus a transaction-scoped advisory lock, so concurrent
//! processes sharing the database also take turns.

use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::loader::postgres::{column_list, quote_ident};
use crate::schema::TableKind;

const ADVISORY_LOCK_KEY: &str = "bulkflow.staging";

/// PostgreSQL truncates longer identifiers
const MAX_IDENTIFIER_BYTES: usize = 63;

/// Staging table name for one load of `table`
pub fn staging_table(table: TableKind, run: Uuid) -> String {
    let name = format!("ingest_staging_{}_{}", table.table_name(), run.simple());
    debug_assert!(name.len() <= MAX_IDENTIFIER_BYTES);
    name
}

/// Whether an index definition from `pg_indexes` mentions any of `columns`
pub fn index_touches_columns(definition: &str, columns: &[&str]) -> bool {
    let Some(start) = definition.find('(') else {
        return false;
    };
    definition[start..]
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
        .any(|token| columns.iter().any(|col| col.eq_ignore_ascii_case(token)))
}

#[derive(Debug, Clone)]
pub struct StagingMigrator {
    pool: PgPool,
    write_lock: Arc<Mutex<()>>,
}

impl StagingMigrator {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create a fresh staging table for one load of `table`; returns its name
    pub async fn prepare(&self, table: TableKind) -> Result<String> {
        let staging = staging_table(table, Uuid::new_v4());
        let create = format!(
            "CREATE UNLOGGED TABLE {} (LIKE {} INCLUDING DEFAULTS) \
             WITH (autovacuum_enabled = false)",
            quote_ident(&staging),
            quote_ident(table.table_name())
        );
        sqlx::raw_sql(&create).execute(&self.pool).await?;
        debug!(table = %table, staging = %staging, "Staging table ready");
        Ok(staging)
    }

    /// Move the rows of `staging` into the final table and drop it; returns the number of
    /// rows merged.
    ///
    /// On error the transaction is rolled back and the staging table is left for
    /// [`StagingMigrator::discard`].
    pub async fn migrate(&self, table: TableKind, staging: &str, columns: &[&str]) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let staging = quote_ident(staging);
        let target = quote_ident(table.table_name());
        let columns = column_list(columns);

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(ADVISORY_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        let insert = format!(
            "INSERT INTO {target} ({columns}) SELECT {columns} FROM {staging} ON CONFLICT DO NOTHING"
        );
        let merged = sqlx::raw_sql(&insert)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let drop = format!("DROP TABLE {staging}");
        sqlx::raw_sql(&drop).execute(&mut *tx).await?;
        tx.commit().await?;

        info!(table = %table, merged, "Staged rows merged");
        Ok(merged)
    }

    /// Drop a staging table whose rows will not be merged
    pub async fn discard(&self, staging: &str) {
        let drop = format!("DROP TABLE IF EXISTS {}", quote_ident(staging));
        match sqlx::raw_sql(&drop).execute(&self.pool).await {
            Ok(_) => debug!(staging = %staging, "Staging table dropped"),
            Err(e) => warn!(staging = %staging, error = %e, "Could not drop staging table"),
        }
    }

    /// Rebuild every index of `table` that covers a loaded column.
    ///
    /// Runs after the merge has committed; a failed rebuild is logged and skipped. Returns
    /// the indexes rebuilt.
    pub async fn rebuild_indexes(&self, table: TableKind, columns: &[&str]) -> Vec<String> {
        let indexes: Vec<(String, String)> = match sqlx::query_as(
            "SELECT indexname, indexdef FROM pg_indexes \
             WHERE schemaname = current_schema() AND tablename = $1",
        )
        .bind(table.table_name())
        .fetch_all(&self.pool)
        .await
        {
            Ok(indexes) => indexes,
            Err(e) => {
                warn!(table = %table, error = %e, "Could not list indexes");
                return Vec::new();
            },
        };

        let mut rebuilt = Vec::new();
        for (name, definition) in indexes {
            if !index_touches_columns(&definition, columns) {
                continue;
            }
            let reindex = format!("REINDEX INDEX CONCURRENTLY {}", quote_ident(&name));
            match sqlx::raw_sql(&reindex).execute(&self.pool).await {
                Ok(_) => {
                    debug!(table = %table, index = %name, "Index rebuilt");
                    rebuilt.push(name);
                },
                Err(e) => warn!(table = %table, index = %name, error = %e, "Index rebuild failed"),
            }
        }
        rebuilt
    }
}
