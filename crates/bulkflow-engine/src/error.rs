//! Error taxonomy for ingestion runs
//!
//! Every failure a run can end with maps to one [`IngestError`] variant, and every variant
//! exposes a stable [`IngestError::category`] tag that callers and the failure log key on.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::request::IngestResult;

/// Resource limits that terminate a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LimitKind {
    MaxRows,
    MaxDuration,
    MaxDeadLetters,
    HeapLimit,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::MaxRows => "max-rows-exceeded",
            LimitKind::MaxDuration => "max-duration-exceeded",
            LimitKind::MaxDeadLetters => "max-dead-letters-exceeded",
            LimitKind::HeapLimit => "heap-limit-exceeded",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported table: {0}")]
    UnsupportedTable(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed delimited input: {0}")]
    Csv(#[from] csv::Error),

    #[error("Record {ordinal} rejected: {reason}")]
    Rejected { ordinal: u64, reason: String },

    #[error("Sink did not drain within {waited_ms} ms")]
    BackpressureTimeout { waited_ms: u64 },

    #[error("{limit}: {detail}")]
    ResourceLimit { limit: LimitKind, detail: String },

    #[error("Aborted")]
    Aborted,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Sink error: {0}")]
    Sink(String),
}

impl IngestError {
    pub fn limit(limit: LimitKind, detail: impl Into<String>) -> Self {
        IngestError::ResourceLimit {
            limit,
            detail: detail.into(),
        }
    }

    /// Stable tag for the failure category
    pub fn category(&self) -> &'static str {
        match self {
            IngestError::Validation(_) => "validation",
            IngestError::UnsupportedTable(_)
            | IngestError::Source(_)
            | IngestError::Io(_)
            | IngestError::Http(_)
            | IngestError::Json(_)
            | IngestError::Csv(_) => "source",
            IngestError::Rejected { .. } => "rejected",
            IngestError::BackpressureTimeout { .. } => "backpressure-timeout",
            IngestError::ResourceLimit { limit, .. } => limit.as_str(),
            IngestError::Aborted => "aborted",
            IngestError::Database(_) | IngestError::Sink(_) => "database",
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, IngestError::Aborted)
    }

    /// Whether rows already handed to the sink must be rolled back.
    ///
    /// Cancellation, source failures and resource limits commit what was sent so that the
    /// counts and the checkpoint describe the same rows. A broken or stuck sink, and a strict
    /// mode rejection, discard the whole load.
    pub fn rolls_back_load(&self) -> bool {
        matches!(
            self,
            IngestError::Rejected { .. }
                | IngestError::BackpressureTimeout { .. }
                | IngestError::Database(_)
                | IngestError::Sink(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// A run that ended in failure, together with the partial counts it reached
#[derive(Debug, Error)]
#[error("ingestion failed ({}): {error}", error.category())]
pub struct RunFailure {
    #[source]
    pub error: IngestError,
    pub result: IngestResult,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_categories() {
        let err = IngestError::limit(LimitKind::HeapLimit, "612 MB above 512 MB");
        assert_eq!(err.category(), "heap-limit-exceeded");
        assert_eq!(
            err.to_string(),
            "heap-limit-exceeded: 612 MB above 512 MB"
        );

        let err = IngestError::limit(LimitKind::MaxRows, "reached 10 rows");
        assert_eq!(err.category(), "max-rows-exceeded");
    }

    #[test]
    fn test_source_categories() {
        let io = IngestError::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing.csv",
        ));
        assert_eq!(io.category(), "source");
        assert_eq!(
            IngestError::UnsupportedTable("invoices".into()).category(),
            "source"
        );
        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(IngestError::from(json).category(), "source");
    }

    #[test]
    fn test_rollback_policy() {
        assert!(!IngestError::Aborted.rolls_back_load());
        assert!(!IngestError::limit(LimitKind::MaxDuration, "x").rolls_back_load());
        assert!(!IngestError::Source("bad page".into()).rolls_back_load());
        assert!(IngestError::BackpressureTimeout { waited_ms: 10 }.rolls_back_load());
        assert!(IngestError::Sink("closed".into()).rolls_back_load());
        assert!(IngestError::Rejected {
            ordinal: 3,
            reason: "missing ordrenr".into()
        }
        .rolls_back_load());
    }
}
