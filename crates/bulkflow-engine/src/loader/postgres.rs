//! PostgreSQL COPY sink
//!
//! A spawned task owns the `COPY ... FROM STDIN` connection and is fed through a bounded
//! channel. A full channel is what the loader sees as backpressure.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgCopyIn, PgPoolCopyExt};
use sqlx::{PgPool, Postgres};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::sink::{ChunkSink, Offer, SinkFactory};
use crate::error::{IngestError, Result};

/// Quote an identifier for use in generated SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `COPY "table" ("a", "b") FROM STDIN WITH (FORMAT text)`
pub fn copy_statement(table: &str, columns: &[&str]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        quote_ident(table),
        column_list(columns)
    )
}

enum CopyCommand {
    Chunk(Bytes),
    Finish,
    Abort(String),
}

type CopyConnection = PgCopyIn<PoolConnection<Postgres>>;

async fn drive_copy(mut copy: CopyConnection, mut rx: mpsc::Receiver<CopyCommand>) -> Result<u64> {
    loop {
        match rx.recv().await {
            Some(CopyCommand::Chunk(chunk)) => {
                let sent = copy.send(chunk).await.map(|_| ());
                if let Err(e) = sent {
                    if let Err(abort_err) = copy.abort("chunk could not be sent").await {
                        debug!(error = %abort_err, "COPY abort after send failure");
                    }
                    return Err(e.into());
                }
            },
            Some(CopyCommand::Finish) => return Ok(copy.finish().await?),
            Some(CopyCommand::Abort(reason)) => {
                copy.abort(reason).await?;
                return Ok(0);
            },
            // Sink dropped without finishing: nothing may be committed
            None => {
                copy.abort("sink dropped").await?;
                return Ok(0);
            },
        }
    }
}

/// Opens one COPY per table load on a pooled connection
#[derive(Debug, Clone)]
pub struct PgSinkFactory {
    pool: PgPool,
    queue_chunks: usize,
}

impl PgSinkFactory {
    pub fn new(pool: PgPool, queue_chunks: usize) -> Self {
        Self {
            pool,
            queue_chunks: queue_chunks.max(1),
        }
    }
}

#[async_trait]
impl SinkFactory for PgSinkFactory {
    async fn open(&self, table: &str, columns: &[&str]) -> Result<Box<dyn ChunkSink>> {
        let statement = copy_statement(table, columns);
        debug!(%statement, "Starting COPY");
        let copy = self.pool.copy_in_raw(&statement).await?;

        let (tx, rx) = mpsc::channel(self.queue_chunks);
        let task = tokio::spawn(drive_copy(copy, rx));
        Ok(Box::new(PgCopySink {
            table: table.to_string(),
            tx,
            task,
        }))
    }
}

pub struct PgCopySink {
    table: String,
    tx: mpsc::Sender<CopyCommand>,
    task: JoinHandle<Result<u64>>,
}

impl PgCopySink {
    fn stopped(&self) -> IngestError {
        IngestError::Sink(format!("COPY into {} stopped", self.table))
    }

    async fn join(self) -> Result<u64> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(IngestError::Sink(format!(
                "COPY task for {} failed: {e}",
                self.table
            ))),
        }
    }
}

#[async_trait]
impl ChunkSink for PgCopySink {
    fn offer(&mut self, chunk: Bytes) -> Result<Offer> {
        match self.tx.try_send(CopyCommand::Chunk(chunk)) {
            Ok(()) => Ok(Offer::Accepted),
            Err(TrySendError::Full(CopyCommand::Chunk(chunk))) => Ok(Offer::Saturated(chunk)),
            Err(_) => Err(self.stopped()),
        }
    }

    async fn write_when_drained(&mut self, chunk: Bytes) -> Result<()> {
        self.tx
            .send(CopyCommand::Chunk(chunk))
            .await
            .map_err(|_| self.stopped())
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        if self.tx.send(CopyCommand::Finish).await.is_err() {
            // The task already ended; its result explains why
            return match (*self).join().await {
                Ok(_) => Err(IngestError::Sink("COPY ended before finish".into())),
                Err(e) => Err(e),
            };
        }
        (*self).join().await
    }

    async fn abort(self: Box<Self>, reason: &str) {
        let table = self.table.clone();
        let _ = self.tx.send(CopyCommand::Abort(reason.to_string())).await;
        if let Err(e) = (*self).join().await {
            warn!(table = %table, error = %e, "COPY abort reported an error");
        }
    }
}
