//! Error types shared across bulkflow crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while configuring process-wide infrastructure
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Invalid log output: {0}")]
    InvalidLogOutput(String),

    #[error("Invalid log format: {0}")]
    InvalidLogFormat(String),

    #[error("Invalid filter directive '{directive}': {reason}")]
    InvalidDirective { directive: String, reason: String },

    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(String),
}
