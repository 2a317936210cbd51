//! Shared helpers for the engine integration tests
//!
//! Database-backed tests start a throwaway PostgreSQL container with the schema applied and
//! need Docker; they are `#[ignore]`d by default. Run them with:
//!
//! ```bash
//! cargo test -p bulkflow-engine -- --ignored --nocapture
//! ```

#![allow(dead_code)]

use anyhow::{Context, Result};
use bulkflow_engine::{db, EngineConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

/// PostgreSQL container with the ingestion schema applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;
        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;
        db::run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_clone(&self) -> PgPool {
        self.pool.clone()
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .unwrap_or(-1)
    }

    /// Staging tables still present in the database
    pub async fn staging_tables(&self) -> Vec<String> {
        sqlx::query_scalar(
            "SELECT tablename::text FROM pg_tables \
             WHERE schemaname = current_schema() AND tablename LIKE 'ingest_staging_%'",
        )
        .fetch_all(&self.pool)
        .await
        .unwrap()
    }
}

/// Small buffers and batches so short fixtures still produce several chunks
pub fn small_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.loader.buffer_bytes = 8 * 1024;
    config.loader.row_reserve_bytes = 512;
    config.loader.batch_initial_rows = 16;
    config.loader.batch_min_rows = 2;
    config.loader.batch_max_rows = 256;
    config.loader.grow_every_chunks = 4;
    config.api.retry_base_ms = 10;
    config
}

pub fn write_fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap_or_else(|e| panic!("writing {name}: {e}"));
    path
}

/// `ordrenr` header plus one row per order number in `range`
pub fn orders_csv(range: std::ops::RangeInclusive<u64>) -> String {
    let mut contents = String::from("ordrenr;kundenr;ordredato;sum\n");
    for n in range {
        contents.push_str(&format!("{n};{};{}.1.2026;{},50\n", 100 + n % 7, 1 + n % 28, n * 3));
    }
    contents
}

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,bulkflow_engine=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}
