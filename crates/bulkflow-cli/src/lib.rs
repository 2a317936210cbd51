//! Bulkflow CLI Library
//!
//! Command-line front end for the bulkflow ingestion engine.
//!
//! # Overview
//!
//! - **Requests**: Run a JSON ingestion request as-is (`bulkflow run`)
//! - **Ad-hoc loads**: Load a CSV file, a JSON file or a paginated API (`bulkflow load`)
//! - **Synthetic data**: Generate orders and order lines (`bulkflow generate`)
//! - **Schema**: Apply the database migrations (`bulkflow migrate`)
//!
//! Results are printed to stdout as pretty JSON; logs and progress go to stderr. Pressing
//! Ctrl-C cancels the running job and prints what was committed.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod commands;
pub mod error;
pub mod progress;

pub use error::{CliError, Result};

use bulkflow_engine::request::Compression;
use bulkflow_engine::{IngestRequest, OnConflict};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Bulkflow - streaming bulk ingestion into PostgreSQL
#[derive(Parser, Debug)]
#[command(name = "bulkflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Load into in-memory tables instead of the database
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Do not show the progress spinner
    #[arg(long, global = true)]
    pub no_progress: bool,

    /// Print the command reference as markdown
    #[arg(long, hide = true)]
    pub markdown_help: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an ingestion request read from a JSON file ("-" reads stdin)
    Run {
        /// Path to the request file
        request: PathBuf,
    },

    /// Load a single source into a table
    Load {
        #[command(subcommand)]
        source: LoadSource,
    },

    /// Generate synthetic orders and order lines
    Generate {
        /// Number of orders
        #[arg(long)]
        orders: u64,

        /// Lines per order
        #[arg(long, default_value = "3")]
        lines_per_order: u32,

        /// Company id written to every row
        #[arg(long, default_value = "1")]
        company_id: i64,

        /// First order number
        #[arg(long, default_value = "1")]
        start_order_number: i64,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Apply the database schema
    Migrate,
}

/// Sources for `bulkflow load`
#[derive(Subcommand, Debug)]
pub enum LoadSource {
    /// Delimited text file, optionally gzip-compressed
    Csv {
        /// Input file
        file: PathBuf,

        /// Destination table
        #[arg(short, long)]
        table: String,

        /// Field delimiter (detected from the header when omitted)
        #[arg(short, long)]
        delimiter: Option<char>,

        #[arg(long, value_enum, default_value_t = CompressionArg::Auto)]
        compression: CompressionArg,

        #[command(flatten)]
        options: RunOptions,
    },

    /// JSON array or newline-delimited JSON file
    Json {
        /// Input file
        file: PathBuf,

        /// Destination table
        #[arg(short, long)]
        table: String,

        /// One JSON object per line instead of a top-level array
        #[arg(long)]
        ndjson: bool,

        #[arg(long, value_enum, default_value_t = CompressionArg::Auto)]
        compression: CompressionArg,

        #[command(flatten)]
        options: RunOptions,
    },

    /// Paginated HTTP JSON API
    Api {
        /// First page URL
        url: String,

        /// Destination table
        #[arg(short, long)]
        table: String,

        /// HTTP method
        #[arg(long)]
        method: Option<String>,

        /// Request header as "Name: value" (repeatable)
        #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
        headers: Vec<String>,

        /// JSON request body
        #[arg(long)]
        body: Option<String>,

        /// Dot path to the record array in each response
        #[arg(long)]
        data_path: Option<String>,

        /// Dot path to the next page token in each response
        #[arg(long)]
        next_page_path: Option<String>,

        #[arg(long)]
        max_pages: Option<u64>,

        /// Minimum delay between page requests
        #[arg(long)]
        min_request_interval_ms: Option<u64>,

        /// Pages fetched ahead concurrently
        #[arg(long)]
        parallel_pages: Option<u32>,

        /// Per-request timeout
        #[arg(long)]
        timeout_ms: Option<u64>,

        #[command(flatten)]
        options: RunOptions,
    },
}

/// Options shared by every ingestion command
#[derive(Args, Debug, Clone, Default)]
pub struct RunOptions {
    /// Fail and roll back the load on the first rejected row
    #[arg(long)]
    pub strict: bool,

    /// What happens when a row's key already exists
    #[arg(long, value_enum, default_value_t = ConflictArg::Error)]
    pub on_conflict: ConflictArg,

    /// Job id (generated when omitted)
    #[arg(long)]
    pub job_id: Option<String>,

    /// Record a checkpoint and resume from the last one under the same job id
    #[arg(long, requires = "job_id")]
    pub checkpoint: bool,

    /// Keep rejected rows in the dead-letter table
    #[arg(long)]
    pub dead_letter: bool,

    /// Source key to column override as "key=column" (repeatable)
    #[arg(short = 'm', long = "map", value_name = "KEY=COLUMN")]
    pub mappings: Vec<String>,

    /// Rows between progress events
    #[arg(long)]
    pub progress_interval: Option<u64>,

    #[arg(long)]
    pub max_rows: Option<u64>,

    #[arg(long)]
    pub max_duration_ms: Option<u64>,

    #[arg(long)]
    pub max_dead_letters: Option<u64>,

    #[arg(long)]
    pub max_heap_mb: Option<u64>,
}

impl RunOptions {
    /// Copy the options onto `request`
    pub fn apply(&self, request: &mut IngestRequest) -> Result<()> {
        request.strict_mode = self.strict;
        request.on_conflict = self.on_conflict.into();
        request.job_id = self.job_id.clone();
        request.checkpoint = self.checkpoint;
        request.dead_letter = self.dead_letter;
        request.progress_interval = self.progress_interval;
        request.max_rows = self.max_rows;
        request.max_duration_ms = self.max_duration_ms;
        request.max_dead_letters = self.max_dead_letters;
        request.max_heap_mb = self.max_heap_mb;
        for mapping in &self.mappings {
            let (key, column) = split_pair(mapping, '=').ok_or_else(|| {
                CliError::InvalidArgument(format!("mapping '{mapping}' is not KEY=COLUMN"))
            })?;
            request.source_mapping.insert(key, column);
        }
        Ok(())
    }
}

/// Split `input` at the first `separator`, trimming both halves; `None` if either is empty
pub fn split_pair(input: &str, separator: char) -> Option<(&str, &str)> {
    let (left, right) = input.split_once(separator)?;
    let (left, right) = (left.trim(), right.trim());
    if left.is_empty() || right.is_empty() {
        return None;
    }
    Some((left, right))
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictArg {
    /// A duplicate key fails the run
    #[default]
    Error,
    /// Load through a staging table and skip duplicates
    Nothing,
}

impl From<ConflictArg> for OnConflict {
    fn from(arg: ConflictArg) -> Self {
        match arg {
            ConflictArg::Error => OnConflict::Error,
            ConflictArg::Nothing => OnConflict::Nothing,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionArg {
    None,
    Gzip,
    /// Detect from the file extension or contents
    #[default]
    Auto,
}

impl From<CompressionArg> for Compression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => Compression::None,
            CompressionArg::Gzip => Compression::Gzip,
            CompressionArg::Auto => Compression::Auto,
        }
    }
}
