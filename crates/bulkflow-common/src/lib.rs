//! Bulkflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing used by every bulkflow workspace member:
//!
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Errors**: the [`CommonError`] type returned by that setup
//!
//! # Example
//!
//! ```no_run
//! use bulkflow_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> bulkflow_common::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
