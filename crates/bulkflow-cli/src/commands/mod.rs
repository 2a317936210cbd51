//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function. Ingestion commands build an
//! [`IngestRequest`] and hand it to [`ingest`].

pub mod generate;
pub mod load;
pub mod migrate;
pub mod run;

use bulkflow_engine::{db, EngineConfig, IngestEngine, IngestRequest, IngestResult, JobStatus};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{CliError, Result};
use crate::progress;

/// How the CLI was invoked, independent of the subcommand
#[derive(Debug, Clone, Copy, Default)]
pub struct Invocation {
    pub dry_run: bool,
    pub show_progress: bool,
}

pub fn load_config() -> Result<EngineConfig> {
    EngineConfig::from_env().map_err(|e| CliError::Config(format!("{e:#}")))
}

async fn build_engine(config: EngineConfig, dry_run: bool) -> Result<IngestEngine> {
    if dry_run {
        info!("Dry run, loading into memory");
        return Ok(IngestEngine::builder(config).build()?);
    }
    let pool = db::create_pool(&config.database).await?;
    Ok(IngestEngine::with_postgres(config, pool)?)
}

/// Run one request to completion and print its result.
///
/// Ctrl-C cancels the job; the engine commits what it already handed to the database and the
/// partial result is printed before returning [`CliError::Cancelled`].
pub async fn ingest(mut request: IngestRequest, invocation: Invocation) -> Result<IngestResult> {
    let config = load_config()?;
    let engine = build_engine(config, invocation.dry_run).await?;

    let job_id = request
        .job_id
        .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
        .clone();

    let follower = invocation.show_progress.then(|| {
        let events = engine.registry().subscribe(Some(&job_id)).into_stream();
        let pb = progress::create_spinner(&format!("{job_id}: starting"));
        (progress::follow(events, pb.clone()), pb)
    });

    let run = engine.run(request);
    tokio::pin!(run);
    let mut interrupted = false;
    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                match signal {
                    Ok(()) => {
                        warn!(job_id = %job_id, "Interrupted, cancelling job");
                        engine.cancel(&job_id);
                    }
                    Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
                }
            }
        }
    };

    if let Some((task, pb)) = follower {
        task.abort();
        pb.finish_and_clear();
    }

    match outcome {
        Ok(result) => {
            print_json(&result)?;
            if result.status == JobStatus::Cancelled {
                return Err(CliError::Cancelled(job_id));
            }
            Ok(result)
        }
        Err(failure) => {
            print_json(&failure.result)?;
            Err(CliError::RunFailed {
                category: failure.error.category().to_string(),
                reason: failure
                    .result
                    .failure
                    .unwrap_or_else(|| failure.error.to_string()),
            })
        }
    }
}

/// Print `value` to stdout as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
