//! In-memory job registry
//!
//! Tracks every run from registration to its terminal state, owns the cancellation token of
//! each job, and broadcasts progress to any number of subscribers. The most recent jobs are
//! kept; older terminal entries are evicted once the history is full.

pub mod job;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use job::{Job, JobCounts, JobEvent, JobSpec, JobStatus};

use crate::error::{IngestError, Result};
use crate::failure_log::{FailureLog, FailureRecord};
use crate::source::{Checkpoint, PageCallback};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    job: Job,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Jobs {
    entries: HashMap<String, Entry>,
    /// Registration order, oldest first
    order: VecDeque<String>,
}

pub struct JobRegistry {
    jobs: Mutex<Jobs>,
    events: broadcast::Sender<JobEvent>,
    failure_log: Arc<dyn FailureLog>,
    capacity: usize,
}

/// A job as returned by [`JobRegistry::get_with_failure`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetails {
    #[serde(flatten)]
    pub job: Job,
    pub failure: Option<FailureRecord>,
}

impl JobRegistry {
    pub fn new(capacity: usize, failure_log: Arc<dyn FailureLog>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            jobs: Mutex::new(Jobs::default()),
            events,
            failure_log,
            capacity: capacity.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Start tracking a job.
    ///
    /// Re-registering the id of a finished job replaces it; with checkpointing on, the new
    /// run starts from the checkpoint the previous one reached.
    pub fn register(self: &Arc<Self>, spec: JobSpec) -> Result<JobHandle> {
        let id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cancel = CancellationToken::new();

        let resume = {
            let mut jobs = self.lock();
            let previous = match jobs.entries.get(&id) {
                Some(entry) if !entry.job.status.is_terminal() => {
                    return Err(IngestError::Validation(format!(
                        "job {id} is already {}",
                        entry.job.status
                    )));
                },
                Some(entry) => entry.job.checkpoint.clone(),
                None => None,
            };
            let resume = if spec.checkpointing { previous } else { None };

            jobs.order.retain(|existing| existing != &id);
            jobs.entries.insert(
                id.clone(),
                Entry {
                    job: Job::new(id.clone(), &spec, resume.clone()),
                    cancel: cancel.clone(),
                },
            );
            jobs.order.push_back(id.clone());
            self.evict(&mut jobs);
            resume
        };

        info!(
            job_id = %id,
            table = %spec.table,
            source = %spec.source,
            resuming = resume.is_some(),
            "Job registered"
        );

        Ok(JobHandle {
            registry: Arc::clone(self),
            id,
            cancel,
            resume,
        })
    }

    fn evict(&self, jobs: &mut Jobs) {
        while jobs.entries.len() > self.capacity {
            let Some(position) = jobs.order.iter().position(|id| {
                jobs.entries
                    .get(id)
                    .is_some_and(|entry| entry.job.status.is_terminal())
            }) else {
                // Only live jobs left; the history may run over until one finishes
                break;
            };
            if let Some(id) = jobs.order.remove(position) {
                jobs.entries.remove(&id);
                debug!(job_id = %id, "Evicted job from history");
            }
        }
    }

    /// Most recent first
    pub fn list(&self) -> Vec<Job> {
        let jobs = self.lock();
        jobs.order
            .iter()
            .rev()
            .filter_map(|id| jobs.entries.get(id).map(|entry| entry.job.clone()))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.lock().entries.get(id).map(|entry| entry.job.clone())
    }

    /// The job plus the last failure the durable log holds for it
    pub async fn get_with_failure(&self, id: &str) -> Option<JobDetails> {
        let job = self.get(id)?;
        let failure = match self.failure_log.last_for(id).await {
            Ok(failure) => failure,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Failed to read failure log");
                None
            },
        };
        Some(JobDetails { job, failure })
    }

    /// Request cancellation; `false` if the job is unknown or already finished
    pub fn cancel(&self, id: &str) -> bool {
        let mut jobs = self.lock();
        let Some(entry) = jobs.entries.get_mut(id) else {
            return false;
        };
        if entry.job.status.is_terminal() {
            return false;
        }
        entry.job.cancel_requested = true;
        entry.cancel.cancel();
        info!(job_id = %id, "Cancellation requested");
        true
    }

    /// Receive progress events; `job_id` narrows them to one job (keep-alives always pass)
    pub fn subscribe(&self, job_id: Option<&str>) -> ProgressSubscription {
        ProgressSubscription {
            rx: Some(self.events.subscribe()),
            job_id: job_id.map(str::to_string),
        }
    }

    /// Emit a keep-alive event every `interval` until the registry is dropped
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.emit(JobEvent::KeepAlive { at: Utc::now() });
            }
        })
    }

    fn note_cursor(&self, id: &str, cursor: &str) {
        self.update(id, |job| {
            job.last_cursor = Some(cursor.to_string());
            None
        });
    }

    /// Apply `update` to a live job and return the event to broadcast
    fn update<F>(&self, id: &str, update: F) -> Option<JobEvent>
    where
        F: FnOnce(&mut Job) -> Option<JobEvent>,
    {
        let mut jobs = self.lock();
        let entry = jobs.entries.get_mut(id)?;
        update(&mut entry.job)
    }

    fn finish(
        &self,
        id: &str,
        status: JobStatus,
        counts: JobCounts,
        checkpoint: Option<Checkpoint>,
        failure: Option<&IngestError>,
    ) -> bool {
        let reason = failure.map(ToString::to_string);
        let event = self.update(id, |job| {
            if !job.status.can_transition_to(status) {
                warn!(
                    job_id = %job.id,
                    from = %job.status,
                    to = %status,
                    "Ignoring invalid job transition"
                );
                return None;
            }
            job.status = status;
            job.counts = counts;
            // The terminal checkpoint describes committed rows only
            job.checkpoint = checkpoint;
            job.completed_at = Some(Utc::now());
            if let Some(error) = failure {
                job.last_failure = reason.clone();
                job.failure_category = Some(error.category().to_string());
            }
            Some(JobEvent::Finished {
                job_id: job.id.clone(),
                status,
                reason: reason.clone(),
            })
        });
        match event {
            Some(event) => {
                self.emit(event);
                true
            },
            None => false,
        }
    }
}

/// The running side of a registered job
pub struct JobHandle {
    registry: Arc<JobRegistry>,
    id: String,
    cancel: CancellationToken,
    resume: Option<Checkpoint>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Checkpoint the run should resume from
    pub fn resume_checkpoint(&self) -> Option<&Checkpoint> {
        self.resume.as_ref()
    }

    pub fn mark_running(&self) {
        let event = self.registry.update(&self.id, |job| {
            if !job.status.can_transition_to(JobStatus::Running) {
                return None;
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            Some(job.progress_event())
        });
        if let Some(event) = event {
            self.registry.emit(event);
        }
    }

    /// Record progress; a checkpoint behind the stored one is ignored
    pub fn report_progress(&self, counts: JobCounts, checkpoint: Option<Checkpoint>) {
        let event = self.registry.update(&self.id, |job| {
            if job.status.is_terminal() {
                return None;
            }
            job.counts = counts;
            if let Some(next) = checkpoint {
                match &job.checkpoint {
                    Some(current) if *current != next && !next.is_ahead_of(current) => {
                        warn!(
                            job_id = %job.id,
                            ?current,
                            ?next,
                            "Ignoring checkpoint that does not move forward"
                        );
                    },
                    _ => job.checkpoint = Some(next),
                }
            }
            Some(job.progress_event())
        });
        if let Some(event) = event {
            self.registry.emit(event);
        }
    }

    /// Remember the latest next-page token of an API source
    pub fn note_cursor(&self, cursor: &str) {
        self.registry.note_cursor(&self.id, cursor);
    }

    /// Callback for sources that discover page cursors
    pub fn cursor_recorder(&self) -> PageCallback {
        let registry = Arc::clone(&self.registry);
        let id = self.id.clone();
        Arc::new(move |cursor: &str| registry.note_cursor(&id, cursor))
    }

    pub fn complete(&self, counts: JobCounts, checkpoint: Option<Checkpoint>) -> bool {
        self.registry
            .finish(&self.id, JobStatus::Completed, counts, checkpoint, None)
    }

    pub fn cancelled(&self, counts: JobCounts, checkpoint: Option<Checkpoint>) -> bool {
        self.registry
            .finish(&self.id, JobStatus::Cancelled, counts, checkpoint, None)
    }

    /// Mark the job failed and append the failure to the durable log
    pub async fn fail(
        &self,
        table: &str,
        counts: JobCounts,
        checkpoint: Option<Checkpoint>,
        error: &IngestError,
    ) -> bool {
        let applied = self
            .registry
            .finish(&self.id, JobStatus::Failed, counts, checkpoint, Some(error));
        let record = FailureRecord::new(&self.id, table, error, counts);
        if let Err(e) = self.registry.failure_log.append(&record).await {
            warn!(job_id = %self.id, error = %e, "Failed to write failure log");
        }
        applied
    }
}

/// A subscriber's view of the progress stream
pub struct ProgressSubscription {
    rx: Option<broadcast::Receiver<JobEvent>>,
    job_id: Option<String>,
}

impl ProgressSubscription {
    /// Next matching event, `None` after unsubscribing or once the registry is gone.
    ///
    /// A subscription to one job also ends after that job's `Finished` event. A subscriber
    /// that falls behind skips the events it missed.
    pub async fn next(&mut self) -> Option<JobEvent> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) => {
                    let wanted = match (&self.job_id, event.job_id()) {
                        (Some(filter), Some(id)) => filter == id,
                        _ => true,
                    };
                    if !wanted {
                        continue;
                    }
                    if self.job_id.is_some() && event.is_terminal() {
                        self.rx = None;
                    }
                    return Some(event);
                },
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress subscriber lagged");
                },
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                },
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.rx = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.rx.is_some()
    }

    pub fn into_stream(self) -> impl Stream<Item = JobEvent> {
        futures::stream::unfold(self, |mut subscription| async move {
            let event = subscription.next().await?;
            Some((event, subscription))
        })
    }
}
