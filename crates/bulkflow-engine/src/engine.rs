//! Ingestion runner
//!
//! [`IngestEngine::run`] drives one request end to end on the calling task: register the job,
//! read the source, transform and load every record, merge staged rows, then settle the job
//! in the registry and record metrics.

use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::dead_letter::{
    DeadLetterSink, DeadLetterWriter, MemoryDeadLetterSink, PgDeadLetterSink,
    DEFAULT_DEAD_LETTER_BATCH,
};
use crate::error::{IngestError, LimitKind, Result, RunFailure};
use crate::failure_log::{FailureLog, MemoryFailureLog, PgFailureLog};
use crate::loader::{
    BatchStats, BufferPool, BulkLoader, HeapGuard, LoaderSettings, MemorySinkFactory,
    PgSinkFactory, ProcessMemorySampler, SinkFactory,
};
use crate::metrics::{rows_per_second, MetricsRecorder, RunMetrics};
use crate::planner::plan_columns;
use crate::registry::{JobCounts, JobHandle, JobRegistry, JobSpec, JobStatus};
use crate::request::{GeneratorOptions, IngestRequest, IngestResult, OnConflict, SourceType};
use crate::schema::TableKind;
use crate::source::generator::GeneratorSource;
use crate::source::{open_source, Checkpoint, RawRecord, RecordSource, SourceContext, SourceRecord};
use crate::staging::StagingMigrator;
use crate::transform::{TransformPipeline, Transformed};

pub struct IngestEngine {
    config: EngineConfig,
    loader_settings: LoaderSettings,
    registry: Arc<JobRegistry>,
    metrics: Arc<MetricsRecorder>,
    buffers: Arc<BufferPool>,
    sinks: Arc<dyn SinkFactory>,
    dead_letters: Arc<dyn DeadLetterSink>,
    staging: Option<StagingMigrator>,
    http: reqwest::Client,
}

pub struct IngestEngineBuilder {
    config: EngineConfig,
    sinks: Option<Arc<dyn SinkFactory>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    failure_log: Option<Arc<dyn FailureLog>>,
    staging: Option<StagingMigrator>,
}

impl IngestEngineBuilder {
    pub fn sinks(mut self, sinks: Arc<dyn SinkFactory>) -> Self {
        self.sinks = Some(sinks);
        self
    }

    pub fn dead_letters(mut self, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    pub fn failure_log(mut self, failure_log: Arc<dyn FailureLog>) -> Self {
        self.failure_log = Some(failure_log);
        self
    }

    /// Route generator runs and `onConflict: nothing` through staging tables
    pub fn staging(mut self, staging: StagingMigrator) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Anything not set explicitly is kept in memory
    pub fn build(self) -> Result<IngestEngine> {
        let config = self.config;
        let http = reqwest::Client::builder()
            .timeout(config.api_timeout())
            .build()?;
        let failure_log = self
            .failure_log
            .unwrap_or_else(|| Arc::new(MemoryFailureLog::new()));

        Ok(IngestEngine {
            loader_settings: config.loader_settings(),
            registry: JobRegistry::new(config.registry.job_history, failure_log),
            metrics: Arc::new(MetricsRecorder::new(config.registry.metrics_history)),
            buffers: BufferPool::new(config.loader.buffer_bytes, config.loader.buffer_pool_size),
            sinks: self
                .sinks
                .unwrap_or_else(|| Arc::new(MemorySinkFactory::new())),
            dead_letters: self
                .dead_letters
                .unwrap_or_else(|| Arc::new(MemoryDeadLetterSink::new())),
            staging: self.staging,
            http,
            config,
        })
    }
}

/// Per-run settings resolved from the request
struct RunContext<'a> {
    handle: &'a JobHandle,
    cancel: CancellationToken,
    strict: bool,
    checkpointing: bool,
    progress_interval: u64,
    max_rows: Option<u64>,
    max_dead_letters: Option<u64>,
    max_heap_mb: Option<u64>,
    max_duration_ms: Option<u64>,
    deadline: Option<Instant>,
    overrides: &'a crate::request::SourceMapping,
}

impl<'a> RunContext<'a> {
    fn new(request: &'a IngestRequest, handle: &'a JobHandle, config: &EngineConfig) -> Self {
        Self {
            handle,
            cancel: handle.cancel_token(),
            strict: request.strict_mode,
            checkpointing: request.checkpoint && request.source_type != SourceType::Generator,
            progress_interval: request
                .progress_interval
                .unwrap_or(config.registry.default_progress_interval)
                .max(1),
            max_rows: request.max_rows,
            max_dead_letters: request.max_dead_letters,
            max_heap_mb: request.max_heap_mb,
            max_duration_ms: request.max_duration_ms,
            deadline: request
                .max_duration_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms)),
            overrides: &request.source_mapping,
        }
    }

    fn duration_exceeded(&self) -> IngestError {
        IngestError::limit(
            LimitKind::MaxDuration,
            format!("run took longer than {} ms", self.max_duration_ms.unwrap_or(0)),
        )
    }

    fn checkpoint_of(&self, state: &RunState) -> Option<Checkpoint> {
        if self.checkpointing {
            state.checkpoint.clone()
        } else {
            None
        }
    }
}

#[derive(Default)]
struct RunState {
    counts: JobCounts,
    /// Position just past the last record consumed
    checkpoint: Option<Checkpoint>,
    stats: BatchStats,
    peak_memory_mb: Option<u64>,
    dead_letters: Option<DeadLetterWriter>,
    rolled_back: u64,
    merged_rows: Option<u64>,
}

impl RunState {
    /// Un-count rows that were committed to a staging table but never merged
    fn discard(&mut self, rows: u64) {
        self.counts.inserted = self.counts.inserted.saturating_sub(rows);
        self.counts.attempted = self.counts.inserted + self.counts.rejected;
        self.rolled_back += rows;
    }
}

struct ActiveLoad {
    pipeline: TransformPipeline,
    loader: BulkLoader,
}

struct LoadOutcome {
    columns: Vec<&'static str>,
    committed: bool,
    /// Rows this load committed
    inserted: u64,
    error: Option<IngestError>,
}

impl IngestEngine {
    pub fn builder(config: EngineConfig) -> IngestEngineBuilder {
        IngestEngineBuilder {
            config,
            sinks: None,
            dead_letters: None,
            failure_log: None,
            staging: None,
        }
    }

    /// Engine loading into PostgreSQL through COPY, with staging and durable logs
    pub fn with_postgres(config: EngineConfig, pool: PgPool) -> Result<Self> {
        let queue_chunks = config.loader.sink_queue_chunks;
        Self::builder(config)
            .sinks(Arc::new(PgSinkFactory::new(pool.clone(), queue_chunks)))
            .dead_letters(Arc::new(PgDeadLetterSink::new(pool.clone())))
            .failure_log(Arc::new(PgFailureLog::new(pool.clone())))
            .staging(StagingMigrator::new(pool))
            .build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn cancel(&self, job_id: &str) -> bool {
        self.registry.cancel(job_id)
    }

    /// Start the registry's keep-alive ticker at the configured interval
    pub fn start_keepalive(&self) -> JoinHandle<()> {
        self.registry
            .spawn_keepalive(self.config.keepalive_interval())
    }

    /// Run one request to completion.
    ///
    /// A cancelled run returns `Ok` with status `cancelled`; any other failure returns the
    /// error together with the partial counts.
    pub async fn run(&self, request: IngestRequest) -> std::result::Result<IngestResult, RunFailure> {
        let started = Instant::now();
        let table = match request.validate() {
            Ok(table) => table,
            Err(error) => {
                warn!(table = %request.table, error = %error, "Ingestion request rejected");
                return Err(rejected_before_start(&request, error, started));
            },
        };

        let handle = match self.registry.register(JobSpec {
            id: request.job_id.clone(),
            table: table.table_name().to_string(),
            source: request.source_type,
            checkpointing: request.checkpoint,
        }) {
            Ok(handle) => handle,
            Err(error) => {
                warn!(job_id = ?request.job_id, error = %error, "Job registration failed");
                return Err(rejected_before_start(&request, error, started));
            },
        };

        let span = info_span!("ingest", job_id = %handle.id(), table = %table);
        self.execute(&request, table, &handle, started)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        request: &IngestRequest,
        table: TableKind,
        handle: &JobHandle,
        started: Instant,
    ) -> std::result::Result<IngestResult, RunFailure> {
        handle.mark_running();
        let ctx = RunContext::new(request, handle, &self.config);
        let mut state = RunState {
            checkpoint: handle.resume_checkpoint().cloned(),
            dead_letters: request.dead_letter.then(|| {
                DeadLetterWriter::new(
                    Arc::clone(&self.dead_letters),
                    handle.id(),
                    DEFAULT_DEAD_LETTER_BATCH,
                )
            }),
            ..RunState::default()
        };
        info!(
            source = %request.source_type,
            strict = request.strict_mode,
            on_conflict = ?request.on_conflict,
            resuming = handle.resume_checkpoint().is_some(),
            "Ingestion started"
        );

        let outcome = match (&request.generator, request.source_type) {
            (Some(options), SourceType::Generator) => {
                self.run_generator(options, &ctx, &mut state).await
            },
            _ => self.run_stream(request, table, &ctx, &mut state).await,
        };

        self.settle(table, &ctx, state, outcome, started).await
    }

    async fn run_stream(
        &self,
        request: &IngestRequest,
        table: TableKind,
        ctx: &RunContext<'_>,
        state: &mut RunState,
    ) -> Result<()> {
        let staging = match (request.on_conflict, self.staging.as_ref()) {
            (OnConflict::Nothing, Some(staging)) => Some(staging),
            (OnConflict::Nothing, None) => {
                warn!("No staging database, loading directly; duplicate keys fail the load");
                None
            },
            (OnConflict::Error, _) => None,
        };

        let source_ctx = SourceContext {
            cancel: ctx.cancel.clone(),
            resume: ctx.handle.resume_checkpoint().cloned(),
            retry: self.config.retry_policy(),
            default_timeout: self.config.api_timeout(),
            http: self.http.clone(),
            on_next_page: Some(ctx.handle.cursor_recorder()),
        };
        let mut source = open_source(request, source_ctx).await?;

        let destination = match staging {
            Some(staging) => staging.prepare(table).await?,
            None => table.table_name().to_string(),
        };
        let outcome = self
            .load_table(ctx, state, table, &destination, &mut *source)
            .await;

        if let Some(staging) = staging {
            if outcome.committed && !outcome.columns.is_empty() {
                self.merge_staged(
                    staging,
                    table,
                    &destination,
                    &outcome.columns,
                    outcome.inserted,
                    state,
                )
                .await?;
            } else {
                staging.discard(&destination).await;
            }
        }
        match outcome.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Orders first, then their lines, each with its own batch state
    async fn run_generator(
        &self,
        options: &GeneratorOptions,
        ctx: &RunContext<'_>,
        state: &mut RunState,
    ) -> Result<()> {
        if ctx.handle.resume_checkpoint().is_some() {
            warn!("Generator runs do not resume; starting from the first order");
        }
        state.checkpoint = None;
        let staging = self.staging.as_ref();
        if staging.is_none() {
            debug!("No staging database, generator loads directly");
        }

        let mut failure = None;
        let mut staged = Vec::new();
        for table in [TableKind::Orders, TableKind::OrderLines] {
            let mut source = match GeneratorSource::new(options, table, ctx.cancel.clone()) {
                Ok(source) => source,
                Err(e) => {
                    failure = Some(e);
                    break;
                },
            };
            info!(target_table = %table, records = source.total_records(), "Generating records");

            let destination = match staging {
                Some(staging) => match staging.prepare(table).await {
                    Ok(name) => name,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    },
                },
                None => table.table_name().to_string(),
            };
            let outcome = self
                .load_table(ctx, state, table, &destination, &mut source)
                .await;
            if outcome.committed && !outcome.columns.is_empty() {
                staged.push((table, destination, outcome.columns, outcome.inserted));
            } else if let Some(staging) = staging {
                staging.discard(&destination).await;
            }
            if let Some(error) = outcome.error {
                failure = Some(error);
                break;
            }
        }

        if let Some(staging) = staging {
            let mut merge_failure = None;
            for (table, destination, columns, inserted) in staged {
                if merge_failure.is_some() {
                    state.discard(inserted);
                    staging.discard(&destination).await;
                    continue;
                }
                if let Err(e) = self
                    .merge_staged(staging, table, &destination, &columns, inserted, state)
                    .await
                {
                    merge_failure = Some(e);
                }
            }
            if failure.is_none() {
                failure = merge_failure;
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn merge_staged(
        &self,
        staging: &StagingMigrator,
        table: TableKind,
        staging_table: &str,
        columns: &[&str],
        staged_rows: u64,
        state: &mut RunState,
    ) -> Result<()> {
        let merged = match staging.migrate(table, staging_table, columns).await {
            Ok(merged) => merged,
            Err(e) => {
                warn!(target_table = %table, staged_rows, error = %e, "Merging staged rows failed");
                state.discard(staged_rows);
                staging.discard(staging_table).await;
                return Err(e);
            },
        };
        *state.merged_rows.get_or_insert(0) += merged;
        if merged < staged_rows {
            info!(
                target_table = %table,
                skipped = staged_rows - merged,
                "Skipped rows whose key already exists"
            );
        }
        if merged > 0 {
            let rebuilt = staging.rebuild_indexes(table, columns).await;
            debug!(target_table = %table, indexes = ?rebuilt, "Indexes rebuilt");
        }
        Ok(())
    }

    /// Stream every record of `source` into `destination` and settle the load.
    ///
    /// Counts and checkpoint in `state` describe committed rows once this returns.
    async fn load_table(
        &self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        table: TableKind,
        destination: &str,
        source: &mut dyn RecordSource,
    ) -> LoadOutcome {
        let base_inserted = state.counts.inserted;
        let base_checkpoint = state.checkpoint.clone();
        let mut load = None;
        let mut error = self
            .drive(ctx, state, table, destination, source, &mut load, base_inserted)
            .await
            .err();

        if let Some(writer) = state.dead_letters.as_mut() {
            if let Err(e) = writer.flush().await {
                warn!(error = %e, "Failed to write dead letters");
                error.get_or_insert(e);
            }
        }

        let Some(ActiveLoad { pipeline, loader }) = load else {
            state.counts.attempted = state.counts.inserted + state.counts.rejected;
            return LoadOutcome {
                columns: Vec::new(),
                committed: false,
                inserted: 0,
                error,
            };
        };

        let columns = pipeline.columns().to_vec();
        let sent = loader.rows_sent();
        state.peak_memory_mb = state.peak_memory_mb.max(loader.peak_memory_mb());
        let mut inserted = 0;
        let committed = match &error {
            Some(e) if e.rolls_back_load() => {
                let stats = loader.abort(&e.to_string()).await;
                state.stats = state.stats.merge(stats);
                state.rolled_back += sent;
                false
            },
            _ => match loader.finish().await {
                Ok(summary) => {
                    inserted = summary.rows_inserted;
                    state.counts.inserted = base_inserted + summary.rows_inserted;
                    state.stats = state.stats.merge(summary.stats);
                    state.peak_memory_mb = state.peak_memory_mb.max(summary.peak_memory_mb);
                    true
                },
                Err(e) => {
                    warn!(destination, error = %e, "Committing the load failed");
                    state.rolled_back += sent;
                    error = Some(e);
                    false
                },
            },
        };

        if !committed {
            state.counts.inserted = base_inserted;
            state.checkpoint = base_checkpoint;
        }
        state.counts.attempted = state.counts.inserted + state.counts.rejected;

        LoadOutcome {
            columns,
            committed,
            inserted,
            error,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        ctx: &RunContext<'_>,
        state: &mut RunState,
        table: TableKind,
        destination: &str,
        source: &mut dyn RecordSource,
        load: &mut Option<ActiveLoad>,
        base_inserted: u64,
    ) -> Result<()> {
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(IngestError::Aborted);
            }
            let Some(SourceRecord { record, checkpoint }) = next_record(ctx, source).await?
            else {
                return Ok(());
            };
            if let Some(max_rows) = ctx.max_rows {
                if state.counts.attempted >= max_rows {
                    return Err(IngestError::limit(
                        LimitKind::MaxRows,
                        format!("source has more than {max_rows} records"),
                    ));
                }
            }

            let active = match load {
                Some(active) => active,
                None => load.insert(
                    self.open_load(ctx, table, destination, source.declared_keys(), &record)
                        .await?,
                ),
            };

            state.counts.attempted += 1;
            let ordinal = state.counts.attempted;
            match active.pipeline.apply(&record) {
                Transformed::Row(values) => {
                    state.checkpoint = Some(checkpoint);
                    active.loader.write_row(&values).await?;
                },
                Transformed::Rejected { reason } => {
                    state.counts.rejected += 1;
                    state.checkpoint = Some(checkpoint);
                    debug!(ordinal, reason = %reason, "Record rejected");
                    if let Some(writer) = state.dead_letters.as_mut() {
                        writer.push(ordinal, Value::Object(record), &reason).await?;
                    }
                    if ctx.strict {
                        return Err(IngestError::Rejected { ordinal, reason });
                    }
                    if let Some(max) = ctx.max_dead_letters {
                        if state.counts.rejected > max {
                            return Err(IngestError::limit(
                                LimitKind::MaxDeadLetters,
                                format!("{} records rejected, limit is {max}", state.counts.rejected),
                            ));
                        }
                    }
                },
            }

            if ordinal % ctx.progress_interval == 0 {
                let counts = JobCounts {
                    attempted: state.counts.attempted,
                    inserted: base_inserted + active.loader.rows_sent(),
                    rejected: state.counts.rejected,
                };
                ctx.handle
                    .report_progress(counts, ctx.checkpoint_of(state));
            }
        }
    }

    /// Plan columns from the declared keys or the first record, then open the sink
    async fn open_load(
        &self,
        ctx: &RunContext<'_>,
        table: TableKind,
        destination: &str,
        declared_keys: Option<&[String]>,
        first: &RawRecord,
    ) -> Result<ActiveLoad> {
        let keys: Vec<String> = match declared_keys {
            Some(keys) => keys.to_vec(),
            None => first.keys().cloned().collect(),
        };
        let plan = plan_columns(&keys, &table.column_names(), ctx.overrides);
        if plan.is_empty() {
            return Err(IngestError::Validation(format!(
                "no source field maps to a column of {table}"
            )));
        }

        let pipeline = TransformPipeline::new(table, &plan);
        let columns = pipeline.columns().to_vec();
        let sink = self.sinks.open(destination, &columns).await?;
        let heap_guard = ctx.max_heap_mb.map(|limit_mb| {
            let warn_mb = self
                .config
                .heap
                .warn_mb
                .unwrap_or(limit_mb / 5 * 4)
                .min(limit_mb);
            HeapGuard::new(
                Box::new(ProcessMemorySampler::new()),
                self.config.heap.check_every_chunks,
                warn_mb,
                limit_mb,
            )
        });
        info!(destination, columns = ?columns, "Load opened");

        Ok(ActiveLoad {
            pipeline,
            loader: BulkLoader::new(
                destination,
                sink,
                Arc::clone(&self.buffers),
                &self.loader_settings,
                heap_guard,
                ctx.cancel.clone(),
            ),
        })
    }

    async fn settle(
        &self,
        table: TableKind,
        ctx: &RunContext<'_>,
        state: RunState,
        outcome: Result<()>,
        started: Instant,
    ) -> std::result::Result<IngestResult, RunFailure> {
        let handle = ctx.handle;
        let elapsed = started.elapsed();
        let counts = state.counts;
        let checkpoint = ctx.checkpoint_of(&state);

        let (status, error) = match outcome {
            Ok(()) => {
                handle.complete(counts, checkpoint);
                (JobStatus::Completed, None)
            },
            Err(e) if e.is_aborted() => {
                handle.cancelled(counts, checkpoint);
                (JobStatus::Cancelled, None)
            },
            Err(e) => {
                handle
                    .fail(table.table_name(), counts, checkpoint, &e)
                    .await;
                (JobStatus::Failed, Some(e))
            },
        };

        let failure = error.as_ref().map(|e| {
            if state.rolled_back > 0 {
                format!("{e}; {} rows rolled back", state.rolled_back)
            } else {
                e.to_string()
            }
        });
        let throughput = rows_per_second(counts.inserted, elapsed);
        let duration_ms = elapsed.as_millis() as u64;

        self.metrics.record(RunMetrics {
            job_id: handle.id().to_string(),
            table: table.table_name().to_string(),
            status,
            duration_ms,
            rows_inserted: counts.inserted,
            rows_per_second: throughput,
            peak_memory_mb: state.peak_memory_mb,
            batch: state.stats,
            recorded_at: chrono::Utc::now(),
        });

        match &error {
            Some(e) => warn!(
                status = %status,
                category = e.category(),
                attempted = counts.attempted,
                inserted = counts.inserted,
                rejected = counts.rejected,
                rolled_back = state.rolled_back,
                duration_ms,
                "Ingestion failed"
            ),
            None => info!(
                status = %status,
                attempted = counts.attempted,
                inserted = counts.inserted,
                rejected = counts.rejected,
                merged = ?state.merged_rows,
                duration_ms,
                rows_per_second = throughput,
                "Ingestion finished"
            ),
        }

        let result = IngestResult {
            job_id: Some(handle.id().to_string()),
            table: table.table_name().to_string(),
            status,
            inserted_rows: counts.inserted,
            attempted_rows: counts.attempted,
            rejected_rows: counts.rejected,
            duration_ms,
            rows_per_second: throughput,
            failure,
            merged_rows: state.merged_rows,
        };
        match error {
            Some(error) => Err(RunFailure { error, result }),
            None => Ok(result),
        }
    }
}

async fn next_record(
    ctx: &RunContext<'_>,
    source: &mut dyn RecordSource,
) -> Result<Option<SourceRecord>> {
    let Some(deadline) = ctx.deadline else {
        return source.next_record().await;
    };
    if Instant::now() >= deadline {
        return Err(ctx.duration_exceeded());
    }
    match timeout_at(deadline, source.next_record()).await {
        Ok(next) => next,
        Err(_) => Err(ctx.duration_exceeded()),
    }
}

fn rejected_before_start(request: &IngestRequest, error: IngestError, started: Instant) -> RunFailure {
    let result = IngestResult {
        job_id: request.job_id.clone(),
        table: request.table.clone(),
        status: JobStatus::Failed,
        inserted_rows: 0,
        attempted_rows: 0,
        rejected_rows: 0,
        duration_ms: started.elapsed().as_millis() as u64,
        rows_per_second: 0.0,
        failure: Some(error.to_string()),
        merged_rows: None,
    };
    RunFailure { error, result }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::loader::{MemorySinkBehavior, Saturation};
    use crate::registry::JobEvent;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct Harness {
        engine: IngestEngine,
        sinks: MemorySinkFactory,
        dead_letters: Arc<MemoryDeadLetterSink>,
        failures: Arc<MemoryFailureLog>,
    }

    fn small_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.loader.buffer_bytes = 4096;
        config.loader.row_reserve_bytes = 256;
        config.loader.batch_initial_rows = 2;
        config.loader.batch_min_rows = 1;
        config.loader.batch_max_rows = 16;
        config
    }

    fn harness(behavior: MemorySinkBehavior) -> Harness {
        let sinks = MemorySinkFactory::with_behavior(behavior);
        let dead_letters = Arc::new(MemoryDeadLetterSink::new());
        let failures = Arc::new(MemoryFailureLog::new());
        let engine = IngestEngine::builder(small_config())
            .sinks(Arc::new(sinks.clone()))
            .dead_letters(dead_letters.clone())
            .failure_log(failures.clone())
            .build()
            .unwrap();
        Harness {
            engine,
            sinks,
            dead_letters,
            failures,
        }
    }

    fn write_csv(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn orders_csv(path: &Path) -> IngestRequest {
        IngestRequest::csv("orders", path)
    }

    #[tokio::test]
    async fn test_non_strict_run_rejects_and_dead_letters() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(
            &dir,
            "orders.csv",
            "ordrenr;kundenr;sum\n1001;5;1.234,50\n;6;20\n1003;7;30\n",
        );
        let h = harness(MemorySinkBehavior::default());
        let mut request = orders_csv(&path);
        request.dead_letter = true;
        request.job_id = Some("orders-1".into());

        let result = h.engine.run(request).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(
            (result.attempted_rows, result.inserted_rows, result.rejected_rows),
            (3, 2, 1)
        );
        assert!(result.failure.is_none());

        let table = h.sinks.table("orders").unwrap();
        assert_eq!(table.rows.len(), 2);
        let sum = table.columns.iter().position(|c| c == "sum").unwrap();
        assert_eq!(table.rows[0][sum].as_deref(), Some("1234.5"));

        let letters = h.dead_letters.records();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].ordinal, 2);
        assert_eq!(letters[0].reason, "missing ordrenr");
        assert_eq!(letters[0].job_id, "orders-1");

        let job = h.engine.registry().get("orders-1").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counts.inserted, 2);
        let metrics = h.engine.metrics().for_job("orders-1").unwrap();
        assert_eq!(metrics.rows_inserted, 2);
    }

    #[tokio::test]
    async fn test_strict_mode_rolls_back_load() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "orders.csv", "ordrenr,sum\n1,10\n2,20\n,30\n4,40\n");
        let h = harness(MemorySinkBehavior::default());
        let mut request = orders_csv(&path);
        request.strict_mode = true;
        request.job_id = Some("strict".into());

        let failure = h.engine.run(request).await.unwrap_err();
        assert_eq!(failure.error.category(), "rejected");
        assert_eq!(failure.result.status, JobStatus::Failed);
        assert_eq!(failure.result.inserted_rows, 0);
        assert_eq!(failure.result.rejected_rows, 1);
        assert_eq!(failure.result.attempted_rows, 1);
        assert!(failure
            .result
            .failure
            .as_deref()
            .unwrap()
            .ends_with("2 rows rolled back"));

        let table = h.sinks.table("orders").unwrap();
        assert!(table.rows.is_empty());
        assert_eq!(table.aborts.len(), 1);

        let logged = h.failures.records();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].category, "rejected");
        let details = h.engine.registry().get_with_failure("strict").await.unwrap();
        assert_eq!(details.job.failure_category.as_deref(), Some("rejected"));
        assert!(details.failure.is_some());
    }

    #[tokio::test]
    async fn test_max_rows_commits_what_was_sent() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "orders.csv", "ordrenr\n1\n2\n3\n4\n5\n");
        let h = harness(MemorySinkBehavior::default());
        let mut request = orders_csv(&path);
        request.max_rows = Some(3);

        let failure = h.engine.run(request).await.unwrap_err();
        assert_eq!(failure.error.category(), "max-rows-exceeded");
        assert_eq!(failure.result.inserted_rows, 3);
        assert_eq!(failure.result.attempted_rows, 3);
        assert_eq!(h.sinks.rows("orders").len(), 3);
    }

    #[tokio::test]
    async fn test_exactly_max_rows_completes() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "orders.csv", "ordrenr\n1\n2\n3\n");
        let h = harness(MemorySinkBehavior::default());
        let mut request = orders_csv(&path);
        request.max_rows = Some(3);

        let result = h.engine.run(request).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.inserted_rows, 3);
    }

    #[tokio::test]
    async fn test_max_dead_letters() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "orders.csv", "ordrenr,sum\n,1\n,2\n3,3\n");
        let h = harness(MemorySinkBehavior::default());
        let mut request = orders_csv(&path);
        request.max_dead_letters = Some(1);

        let failure = h.engine.run(request).await.unwrap_err();
        assert_eq!(failure.error.category(), "max-dead-letters-exceeded");
        assert_eq!(failure.result.rejected_rows, 2);
        assert_eq!(failure.result.inserted_rows, 0);
    }

    #[tokio::test]
    async fn test_cancellation_mid_run_commits_sent_rows() {
        let dir = TempDir::new().unwrap();
        let mut contents = String::from("ordrenr\n");
        for n in 1..=200 {
            contents.push_str(&format!("{n}\n"));
        }
        let path = write_csv(&dir, "orders.csv", &contents);
        let h = harness(MemorySinkBehavior {
            saturation: Saturation::Always,
            drain_delay: Duration::from_millis(5),
            ..MemorySinkBehavior::default()
        });
        let mut request = orders_csv(&path);
        request.job_id = Some("slow".into());
        request.checkpoint = true;
        request.progress_interval = Some(10);

        let registry = Arc::clone(h.engine.registry());
        let mut events = registry.subscribe(Some("slow"));
        let canceller = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    JobEvent::Progress { attempted, .. } if attempted >= 20 => {
                        registry.cancel("slow");
                        break;
                    },
                    JobEvent::Finished { .. } => break,
                    _ => {},
                }
            }
        });

        let result = h.engine.run(request).await.unwrap();
        canceller.await.unwrap();
        assert_eq!(result.status, JobStatus::Cancelled);
        assert!(result.inserted_rows >= 20 && result.inserted_rows < 200);
        assert_eq!(result.attempted_rows, result.inserted_rows);
        assert_eq!(h.sinks.rows("orders").len() as u64, result.inserted_rows);

        let job = h.engine.registry().get("slow").unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.cancel_requested);
        assert!(job.checkpoint.is_some());
    }

    #[tokio::test]
    async fn test_backpressure_timeout_fails_and_rolls_back() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "orders.csv", "ordrenr\n1\n2\n3\n4\n");
        let sinks = MemorySinkFactory::with_behavior(MemorySinkBehavior {
            saturation: Saturation::EveryNth(2),
            never_drains: true,
            ..MemorySinkBehavior::default()
        });
        let mut config = small_config();
        config.loader.drain_timeout_secs = 1;
        let engine = IngestEngine::builder(config)
            .sinks(Arc::new(sinks.clone()))
            .build()
            .unwrap();

        let failure = engine.run(orders_csv(&path)).await.unwrap_err();
        assert_eq!(failure.error.category(), "backpressure-timeout");
        assert_eq!(failure.result.inserted_rows, 0);
        assert!(sinks.rows("orders").is_empty());
    }

    #[tokio::test]
    async fn test_validation_fails_before_registration() {
        let h = harness(MemorySinkBehavior::default());
        let mut request = IngestRequest::csv("orders", "");
        request.job_id = Some("bad".into());

        let failure = h.engine.run(request).await.unwrap_err();
        assert_eq!(failure.error.category(), "validation");
        assert_eq!(failure.result.status, JobStatus::Failed);
        assert!(h.engine.registry().get("bad").is_none());
    }

    #[tokio::test]
    async fn test_missing_file_fails_as_source_error() {
        let h = harness(MemorySinkBehavior::default());
        let request = IngestRequest::csv("orders", "/nonexistent/orders.csv");
        let failure = h.engine.run(request).await.unwrap_err();
        assert_eq!(failure.error.category(), "source");
        assert_eq!(failure.result.attempted_rows, 0);
    }

    #[tokio::test]
    async fn test_generator_without_staging_loads_directly() {
        let h = harness(MemorySinkBehavior::default());
        let request = IngestRequest::generator(GeneratorOptions {
            orders: 5,
            lines_per_order: 3,
            company_id: 2,
            start_order_number: 100,
        });

        let result = h.engine.run(request).await.unwrap();
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.inserted_rows, 20);
        assert_eq!(result.attempted_rows, 20);
        assert_eq!(result.merged_rows, None);
        assert_eq!(h.sinks.rows("orders").len(), 5);

        let lines = h.sinks.table("order_lines").unwrap();
        assert_eq!(lines.rows.len(), 15);
        let linjenr = lines.columns.iter().position(|c| c == "linjenr").unwrap();
        let numbers: Vec<_> = lines.rows[..3]
            .iter()
            .map(|row| row[linjenr].clone().unwrap())
            .collect();
        assert_eq!(numbers, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_sink_failure_on_commit_fails_run() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(&dir, "orders.csv", "ordrenr\n1\n2\n");
        let h = harness(MemorySinkBehavior {
            fail_on_finish: true,
            ..MemorySinkBehavior::default()
        });

        let failure = h.engine.run(orders_csv(&path)).await.unwrap_err();
        assert_eq!(failure.error.category(), "database");
        assert_eq!(failure.result.inserted_rows, 0);
        assert_eq!(failure.result.attempted_rows, 0);
    }
}
