//! Progress spinner driven by job events
//!
//! The spinner draws to stderr and hides itself when stderr is not a terminal.

use bulkflow_engine::JobEvent;
use futures::{Stream, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Create a spinner for a running job
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Spinner text for an event; keep-alives leave the text unchanged
pub fn describe(event: &JobEvent) -> Option<String> {
    match event {
        JobEvent::Progress {
            job_id,
            attempted,
            inserted,
            rejected,
            ..
        } => Some(format!(
            "{job_id}: {} rows read, {} inserted, {} rejected",
            format_count(*attempted),
            format_count(*inserted),
            format_count(*rejected)
        )),
        JobEvent::Finished { job_id, status, .. } => Some(format!("{job_id}: {status}")),
        JobEvent::KeepAlive { .. } => None,
    }
}

/// Update `pb` from `events` until the job finishes
pub fn follow<S>(events: S, pb: ProgressBar) -> JoinHandle<()>
where
    S: Stream<Item = JobEvent> + Send + 'static,
{
    tokio::spawn(async move {
        let mut events = Box::pin(events);
        while let Some(event) = events.next().await {
            if let Some(message) = describe(&event) {
                pb.set_message(message);
            }
            if matches!(event, JobEvent::Finished { .. }) {
                break;
            }
        }
        pb.finish_and_clear();
    })
}

/// Group thousands with spaces ("1 234 567")
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(c);
    }
    out
}
