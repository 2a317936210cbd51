//! Bulkflow ingestion engine
//!
//! Loads delimited files, JSON documents, paginated HTTP APIs and synthetic order data into
//! PostgreSQL at bulk speed.
//!
//! # Overview
//!
//! A run flows through these stages, all on the task that calls [`IngestEngine::run`]:
//!
//! - **Sources** ([`source`]): lazy record streams that resume from a [`source::Checkpoint`]
//! - **Planner** ([`planner`]): maps source keys to destination columns once per run
//! - **Transform** ([`transform`]): normalizes keys, coerces locale numbers and dates, validates
//! - **Loader** ([`loader`]): COPY text encoding into pooled buffers, backpressure, adaptive batches
//! - **Staging** ([`staging`]): unlogged staging tables merged in one transaction
//! - **Registry** ([`registry`]): job lifecycle, cancellation, checkpoints, progress events
//!
//! # Example
//!
//! ```no_run
//! use bulkflow_engine::{db, EngineConfig, IngestEngine, IngestRequest};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::from_env()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     let engine = IngestEngine::with_postgres(config, pool)?;
//!     let result = engine.run(IngestRequest::csv("orders", "orders.csv")).await?;
//!     println!("{} rows inserted", result.inserted_rows);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod failure_log;
pub mod loader;
pub mod metrics;
pub mod planner;
pub mod registry;
pub mod request;
pub mod schema;
pub mod source;
pub mod staging;
pub mod transform;

pub use config::EngineConfig;
pub use engine::{IngestEngine, IngestEngineBuilder};
pub use error::{IngestError, LimitKind, Result, RunFailure};
pub use registry::{Job, JobCounts, JobEvent, JobRegistry, JobStatus};
pub use request::{IngestRequest, IngestResult, OnConflict, SourceType};
pub use schema::TableKind;
