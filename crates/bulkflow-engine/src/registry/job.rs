//! Job records and lifecycle events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::request::SourceType;
use crate::source::Checkpoint;

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// `pending -> running -> {completed | failed | cancelled}`.
    ///
    /// A pending job may also end directly (it can be cancelled or fail before it starts).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => next != JobStatus::Pending,
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub attempted: u64,
    pub inserted: u64,
    pub rejected: u64,
}

/// What the caller asks the registry to track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Caller-supplied id; a UUID is generated when absent
    pub id: Option<String>,
    pub table: String,
    pub source: SourceType,
    /// Carry the checkpoint of a previous run with the same id forward
    pub checkpointing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub table: String,
    pub source: SourceType,
    pub status: JobStatus,
    pub counts: JobCounts,
    pub checkpoint: Option<Checkpoint>,
    /// Checkpoint this run started from
    pub resumed_from: Option<Checkpoint>,
    pub cancel_requested: bool,
    pub last_failure: Option<String>,
    pub failure_category: Option<String>,
    /// Most recent next-page token reported by an API source
    pub last_cursor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(id: String, spec: &JobSpec, resume: Option<Checkpoint>) -> Self {
        Self {
            id,
            table: spec.table.clone(),
            source: spec.source,
            status: JobStatus::Pending,
            counts: JobCounts::default(),
            checkpoint: resume.clone(),
            resumed_from: resume,
            cancel_requested: false,
            last_failure: None,
            failure_category: None,
            last_cursor: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub(crate) fn progress_event(&self) -> JobEvent {
        JobEvent::Progress {
            job_id: self.id.clone(),
            status: self.status,
            attempted: self.counts.attempted,
            inserted: self.counts.inserted,
            rejected: self.counts.rejected,
            checkpoint: self.checkpoint.clone(),
        }
    }
}

/// Broadcast to progress subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        job_id: String,
        status: JobStatus,
        attempted: u64,
        inserted: u64,
        rejected: u64,
        checkpoint: Option<Checkpoint>,
    },
    #[serde(rename_all = "camelCase")]
    Finished {
        job_id: String,
        status: JobStatus,
        reason: Option<String>,
    },
    KeepAlive { at: DateTime<Utc> },
}

impl JobEvent {
    /// Whether this is the last event of its job
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Finished { status, .. } if status.is_terminal())
    }

    /// Job the event belongs to; keep-alives belong to none
    pub fn job_id(&self) -> Option<&str> {
        match self {
            JobEvent::Progress { job_id, .. } | JobEvent::Finished { job_id, .. } => Some(job_id),
            JobEvent::KeepAlive { .. } => None,
        }
    }
}
