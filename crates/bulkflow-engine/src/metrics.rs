//! Last-run metrics
//!
//! Recording never blocks ingestion: if the lock is contended the sample is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, TryLockError};
use std::time::Duration;
use tracing::debug;

use crate::loader::BatchStats;
use crate::registry::JobStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub job_id: String,
    pub table: String,
    pub status: JobStatus,
    pub duration_ms: u64,
    pub rows_inserted: u64,
    pub rows_per_second: f64,
    pub peak_memory_mb: Option<u64>,
    pub batch: BatchStats,
    pub recorded_at: DateTime<Utc>,
}

pub fn rows_per_second(rows: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        rows as f64 / secs
    } else {
        0.0
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    last: Option<RunMetrics>,
    by_job: HashMap<String, RunMetrics>,
    order: VecDeque<String>,
}

#[derive(Debug)]
pub struct MetricsRecorder {
    state: RwLock<MetricsState>,
    per_job_capacity: usize,
}

impl MetricsRecorder {
    pub fn new(per_job_capacity: usize) -> Self {
        Self {
            state: RwLock::new(MetricsState::default()),
            per_job_capacity: per_job_capacity.max(1),
        }
    }

    /// Store a sample; returns `false` when it was dropped because the lock was busy
    pub fn record(&self, metrics: RunMetrics) -> bool {
        let mut state = match self.state.try_write() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!(job_id = %metrics.job_id, "Metrics lock busy, sample dropped");
                return false;
            },
        };

        if state.by_job.insert(metrics.job_id.clone(), metrics.clone()).is_none() {
            state.order.push_back(metrics.job_id.clone());
        }
        while state.order.len() > self.per_job_capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.by_job.remove(&oldest);
            }
        }
        state.last = Some(metrics);
        true
    }

    pub fn last_run(&self) -> Option<RunMetrics> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last
            .clone()
    }

    pub fn for_job(&self, job_id: &str) -> Option<RunMetrics> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_job
            .get(job_id)
            .cloned()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(100)
    }
}
