//! Error types for the bulkflow CLI
//!
//! Messages are user-facing and say what to check next.

use bulkflow_engine::IngestError;
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

/// Exit code for a run interrupted with Ctrl-C
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration is missing or invalid
    #[error("Configuration error: {0}. Check your environment variables or .env file.")]
    Config(String),

    /// Engine setup or database access failed outside a run
    #[error("{0}")]
    Engine(#[from] IngestError),

    /// The ingestion run failed; the partial result has already been printed
    #[error("Ingestion failed ({category}): {reason}")]
    RunFailed { category: String, reason: String },

    /// The run was cancelled; the committed part has already been printed
    #[error("Job '{0}' was cancelled")]
    Cancelled(String),

    /// Request file could not be read
    #[error("File not found: '{0}'. Verify the file path exists and you have read permissions.")]
    FileNotFound(String),

    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// Request file is not a valid ingestion request
    #[error("Failed to parse JSON: {0}. Check the request file syntax.")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Cancelled(_) => EXIT_CANCELLED,
            CliError::InvalidArgument(_) => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Cancelled("nightly".into()).exit_code(), 130);
        assert_eq!(CliError::InvalidArgument("x".into()).exit_code(), 2);
        let failed = CliError::RunFailed {
            category: "source".into(),
            reason: "Source error: missing".into(),
        };
        assert_eq!(failed.exit_code(), 1);
        assert_eq!(
            failed.to_string(),
            "Ingestion failed (source): Source error: missing"
        );
    }
}
