//! Engine configuration
//!
//! Every setting has a default and can be overridden through the environment (a `.env` file
//! is honoured).

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::loader::{BatchSettings, LoaderSettings};
use crate::source::RetryPolicy;

// ============================================================================
// Database
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/bulkflow";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Loader
// ============================================================================

/// Capacity of each pooled encode buffer (1 MiB).
pub const DEFAULT_BUFFER_BYTES: usize = 1024 * 1024;

/// Idle buffers kept in the shared pool.
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 8;

/// A chunk is emitted once less than this many bytes remain in the buffer (64 KiB).
pub const DEFAULT_ROW_RESERVE_BYTES: usize = 64 * 1024;

pub const DEFAULT_BATCH_INITIAL_ROWS: usize = 5_000;
pub const DEFAULT_BATCH_MIN_ROWS: usize = 500;
pub const DEFAULT_BATCH_MAX_ROWS: usize = 50_000;
pub const DEFAULT_GROW_EVERY_CHUNKS: u32 = 8;
pub const DEFAULT_SHRINK_AFTER_STALLS: u32 = 10;

/// Longest wait for a saturated sink to drain.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 60;

/// Chunks queued towards a COPY connection before it counts as saturated.
pub const DEFAULT_SINK_QUEUE_CHUNKS: usize = 4;

// ============================================================================
// Heap guard
// ============================================================================

pub const DEFAULT_HEAP_CHECK_EVERY_CHUNKS: u64 = 16;

// ============================================================================
// Registry
// ============================================================================

/// Jobs kept in the in-memory history.
pub const DEFAULT_JOB_HISTORY: usize = 100;

pub const DEFAULT_KEEPALIVE_SECS: u64 = 15;

/// Records between progress reports when a request does not set its own interval.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 1_000;

/// Jobs kept in the per-job metrics map.
pub const DEFAULT_METRICS_HISTORY: usize = 100;

// ============================================================================
// Remote API sources
// ============================================================================

pub const DEFAULT_API_MAX_RETRIES: u32 = 3;
pub const DEFAULT_API_RETRY_BASE_MS: u64 = 500;
pub const DEFAULT_API_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub loader: LoaderConfig,
    pub heap: HeapConfig,
    pub registry: RegistryConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub buffer_bytes: usize,
    pub buffer_pool_size: usize,
    pub row_reserve_bytes: usize,
    pub batch_initial_rows: usize,
    pub batch_min_rows: usize,
    pub batch_max_rows: usize,
    pub grow_every_chunks: u32,
    pub shrink_after_stalls: u32,
    pub drain_timeout_secs: u64,
    pub sink_queue_chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapConfig {
    pub check_every_chunks: u64,
    /// Warning threshold; defaults to 80% of the run's limit when unset
    pub warn_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub job_history: usize,
    pub keepalive_secs: u64,
    pub default_progress_interval: u64,
    pub metrics_history: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub timeout_ms: u64,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load configuration from environment and defaults
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = EngineConfig {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            loader: LoaderConfig {
                buffer_bytes: env_or("BULKFLOW_BUFFER_BYTES", DEFAULT_BUFFER_BYTES),
                buffer_pool_size: env_or("BULKFLOW_BUFFER_POOL_SIZE", DEFAULT_BUFFER_POOL_SIZE),
                row_reserve_bytes: env_or("BULKFLOW_ROW_RESERVE_BYTES", DEFAULT_ROW_RESERVE_BYTES),
                batch_initial_rows: env_or("BULKFLOW_BATCH_INITIAL", DEFAULT_BATCH_INITIAL_ROWS),
                batch_min_rows: env_or("BULKFLOW_BATCH_MIN", DEFAULT_BATCH_MIN_ROWS),
                batch_max_rows: env_or("BULKFLOW_BATCH_MAX", DEFAULT_BATCH_MAX_ROWS),
                grow_every_chunks: env_or("BULKFLOW_GROW_EVERY_CHUNKS", DEFAULT_GROW_EVERY_CHUNKS),
                shrink_after_stalls: env_or(
                    "BULKFLOW_SHRINK_AFTER_STALLS",
                    DEFAULT_SHRINK_AFTER_STALLS,
                ),
                drain_timeout_secs: env_or(
                    "BULKFLOW_DRAIN_TIMEOUT_SECS",
                    DEFAULT_DRAIN_TIMEOUT_SECS,
                ),
                sink_queue_chunks: env_or("BULKFLOW_SINK_QUEUE_CHUNKS", DEFAULT_SINK_QUEUE_CHUNKS),
            },
            heap: HeapConfig {
                check_every_chunks: env_or(
                    "BULKFLOW_HEAP_CHECK_EVERY_CHUNKS",
                    DEFAULT_HEAP_CHECK_EVERY_CHUNKS,
                ),
                warn_mb: std::env::var("BULKFLOW_HEAP_WARN_MB")
                    .ok()
                    .and_then(|s| s.parse().ok()),
            },
            registry: RegistryConfig {
                job_history: env_or("BULKFLOW_JOB_HISTORY", DEFAULT_JOB_HISTORY),
                keepalive_secs: env_or("BULKFLOW_KEEPALIVE_SECS", DEFAULT_KEEPALIVE_SECS),
                default_progress_interval: env_or(
                    "BULKFLOW_DEFAULT_PROGRESS_INTERVAL",
                    DEFAULT_PROGRESS_INTERVAL,
                ),
                metrics_history: env_or("BULKFLOW_METRICS_HISTORY", DEFAULT_METRICS_HISTORY),
            },
            api: ApiConfig {
                max_retries: env_or("BULKFLOW_API_MAX_RETRIES", DEFAULT_API_MAX_RETRIES),
                retry_base_ms: env_or("BULKFLOW_API_RETRY_BASE_MS", DEFAULT_API_RETRY_BASE_MS),
                timeout_ms: env_or("BULKFLOW_API_TIMEOUT_MS", DEFAULT_API_TIMEOUT_MS),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        let loader = &self.loader;
        if loader.buffer_bytes == 0 {
            anyhow::bail!("Buffer size must be greater than 0");
        }

        if loader.row_reserve_bytes >= loader.buffer_bytes {
            anyhow::bail!(
                "Row reserve ({} bytes) must be smaller than the buffer ({} bytes)",
                loader.row_reserve_bytes,
                loader.buffer_bytes
            );
        }

        if loader.batch_min_rows == 0 || loader.batch_min_rows > loader.batch_max_rows {
            anyhow::bail!(
                "Batch bounds are invalid: min {} rows, max {} rows",
                loader.batch_min_rows,
                loader.batch_max_rows
            );
        }

        if loader.drain_timeout_secs == 0 {
            anyhow::bail!("Drain timeout must be greater than 0");
        }

        if loader.sink_queue_chunks == 0 {
            anyhow::bail!("Sink queue must hold at least one chunk");
        }

        if self.registry.job_history == 0 {
            anyhow::bail!("Job history must keep at least one job");
        }

        if self.registry.default_progress_interval == 0 {
            anyhow::bail!("Default progress interval must be greater than 0");
        }

        if self.api.timeout_ms == 0 {
            anyhow::bail!("API timeout must be greater than 0");
        }

        if loader.buffer_pool_size == 0 {
            tracing::warn!("Buffer pool keeps no idle buffers - every chunk allocates");
        }

        Ok(())
    }

    pub fn loader_settings(&self) -> LoaderSettings {
        LoaderSettings {
            batch: BatchSettings {
                initial_rows: self.loader.batch_initial_rows,
                min_rows: self.loader.batch_min_rows,
                max_rows: self.loader.batch_max_rows,
                grow_every_chunks: self.loader.grow_every_chunks,
                shrink_after_stalls: self.loader.shrink_after_stalls,
            },
            row_reserve_bytes: self.loader.row_reserve_bytes,
            drain_timeout: Duration::from_secs(self.loader.drain_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.api.max_retries,
            base_delay: Duration::from_millis(self.api.retry_base_ms),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api.timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.registry.keepalive_secs.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            loader: LoaderConfig {
                buffer_bytes: DEFAULT_BUFFER_BYTES,
                buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
                row_reserve_bytes: DEFAULT_ROW_RESERVE_BYTES,
                batch_initial_rows: DEFAULT_BATCH_INITIAL_ROWS,
                batch_min_rows: DEFAULT_BATCH_MIN_ROWS,
                batch_max_rows: DEFAULT_BATCH_MAX_ROWS,
                grow_every_chunks: DEFAULT_GROW_EVERY_CHUNKS,
                shrink_after_stalls: DEFAULT_SHRINK_AFTER_STALLS,
                drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
                sink_queue_chunks: DEFAULT_SINK_QUEUE_CHUNKS,
            },
            heap: HeapConfig {
                check_every_chunks: DEFAULT_HEAP_CHECK_EVERY_CHUNKS,
                warn_mb: None,
            },
            registry: RegistryConfig {
                job_history: DEFAULT_JOB_HISTORY,
                keepalive_secs: DEFAULT_KEEPALIVE_SECS,
                default_progress_interval: DEFAULT_PROGRESS_INTERVAL,
                metrics_history: DEFAULT_METRICS_HISTORY,
            },
            api: ApiConfig {
                max_retries: DEFAULT_API_MAX_RETRIES,
                retry_base_ms: DEFAULT_API_RETRY_BASE_MS,
                timeout_ms: DEFAULT_API_TIMEOUT_MS,
            },
        }
    }
}
