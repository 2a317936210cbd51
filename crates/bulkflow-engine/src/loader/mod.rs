//! Bulk loader
//!
//! Rows are encoded in COPY text format into pooled buffers and handed to a [`ChunkSink`] one
//! chunk at a time. A saturated sink counts as a stall: the loader waits for it to drain (up to
//! the drain timeout) and the [`AdaptiveBatcher`] sizes later chunks accordingly.

pub mod adaptive;
pub mod buffer_pool;
pub mod encoder;
pub mod heap_guard;
pub mod postgres;
pub mod sink;

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use adaptive::{AdaptiveBatcher, BatchSettings, BatchStats};
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use encoder::{decode_chunk, decode_row, encode_row};
pub use heap_guard::{HeapGuard, MemorySampler, ProcessMemorySampler};
pub use postgres::{copy_statement, PgCopySink, PgSinkFactory};
pub use sink::{
    ChunkSink, MemorySinkBehavior, MemorySinkFactory, MemoryTable, Offer, Saturation, SinkFactory,
};

use crate::error::{IngestError, Result};
use crate::schema::ColumnValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderSettings {
    pub batch: BatchSettings,
    /// A chunk is emitted once less than this many bytes remain in its buffer
    pub row_reserve_bytes: usize,
    pub drain_timeout: Duration,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            batch: BatchSettings::default(),
            row_reserve_bytes: 64 * 1024,
            drain_timeout: Duration::from_secs(60),
        }
    }
}

/// What a finished load committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub rows_inserted: u64,
    pub stats: BatchStats,
    pub peak_memory_mb: Option<u64>,
}

/// Streams encoded rows of one table into one sink
pub struct BulkLoader {
    table: String,
    sink: Box<dyn ChunkSink>,
    pool: Arc<BufferPool>,
    buffer: Option<PooledBuffer>,
    rows_in_buffer: u64,
    /// Chunk whose drain wait was interrupted by cancellation, delivered on finish
    parked: Option<(Bytes, u64)>,
    rows_sent: u64,
    batcher: AdaptiveBatcher,
    heap_guard: Option<HeapGuard>,
    row_reserve_bytes: usize,
    drain_timeout: Duration,
    cancel: CancellationToken,
}

impl BulkLoader {
    pub fn new(
        table: impl Into<String>,
        sink: Box<dyn ChunkSink>,
        pool: Arc<BufferPool>,
        settings: &LoaderSettings,
        heap_guard: Option<HeapGuard>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            table: table.into(),
            sink,
            pool,
            buffer: None,
            rows_in_buffer: 0,
            parked: None,
            rows_sent: 0,
            batcher: AdaptiveBatcher::new(settings.batch),
            heap_guard,
            row_reserve_bytes: settings.row_reserve_bytes,
            drain_timeout: settings.drain_timeout,
            cancel,
        }
    }

    /// Rows handed to the sink so far (not yet committed)
    pub fn rows_sent(&self) -> u64 {
        self.rows_sent
    }

    pub fn batch_stats(&self) -> BatchStats {
        self.batcher.stats()
    }

    pub fn peak_memory_mb(&self) -> Option<u64> {
        self.heap_guard.as_ref().and_then(HeapGuard::peak_mb)
    }

    /// Encode one row, emitting a chunk when the buffer or the batch target is full.
    ///
    /// Returns [`IngestError::Aborted`] once the job is cancelled; the row is kept and
    /// committed by [`BulkLoader::finish`].
    pub async fn write_row(&mut self, values: &[ColumnValue]) -> Result<()> {
        let pool = &self.pool;
        let buffer = self.buffer.get_or_insert_with(|| pool.checkout());
        encode_row(values, buffer);
        self.rows_in_buffer += 1;

        let full = buffer.remaining() <= self.row_reserve_bytes
            || self.rows_in_buffer >= self.batcher.target() as u64;
        if full {
            self.flush(true).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, interruptible: bool) -> Result<()> {
        let Some(buffer) = self.buffer.take() else {
            return Ok(());
        };
        let rows = std::mem::take(&mut self.rows_in_buffer);
        if buffer.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::copy_from_slice(&buffer);
        drop(buffer);

        let len = chunk.len();
        let stall = match self.sink.offer(chunk)? {
            Offer::Accepted => None,
            Offer::Saturated(chunk) => Some(self.drain(chunk, rows, interruptible).await?),
        };
        self.rows_sent += rows;
        self.batcher.record_chunk(len, stall);

        if interruptible {
            if let Some(guard) = self.heap_guard.as_mut() {
                guard.on_chunk()?;
            }
            if self.cancel.is_cancelled() {
                return Err(IngestError::Aborted);
            }
        }
        Ok(())
    }

    /// Wait for a saturated sink to take `chunk`
    async fn drain(&mut self, chunk: Bytes, rows: u64, interruptible: bool) -> Result<Duration> {
        let started = Instant::now();
        debug!(table = %self.table, bytes = chunk.len(), "Sink saturated, waiting for drain");

        let cancel = self.cancel.clone();
        let outcome = {
            let wait = timeout(
                self.drain_timeout,
                self.sink.write_when_drained(chunk.clone()),
            );
            tokio::select! {
                result = wait => Some(result),
                _ = cancel.cancelled(), if interruptible => None,
            }
        };

        match outcome {
            Some(Ok(written)) => {
                written?;
                Ok(started.elapsed())
            },
            Some(Err(_)) => Err(IngestError::BackpressureTimeout {
                waited_ms: started.elapsed().as_millis() as u64,
            }),
            None => {
                self.parked = Some((chunk, rows));
                Err(IngestError::Aborted)
            },
        }
    }

    /// Deliver everything still buffered and commit the load
    pub async fn finish(mut self) -> Result<LoadSummary> {
        if let Some((chunk, rows)) = self.parked.take() {
            let len = chunk.len();
            let stall = self.drain(chunk, rows, false).await?;
            self.rows_sent += rows;
            self.batcher.record_chunk(len, Some(stall));
        }
        self.flush(false).await?;

        let stats = self.batcher.stats();
        let peak_memory_mb = self.peak_memory_mb();
        let rows_sent = self.rows_sent;
        let table = self.table;
        let rows_inserted = self.sink.finish().await?;
        if rows_inserted != rows_sent {
            debug!(table = %table, rows_sent, rows_inserted, "Sink committed a different row count");
        }
        info!(
            table = %table,
            rows_inserted,
            chunks = stats.chunks_written,
            stalls = stats.stalls,
            target_rows = stats.target_rows,
            "Load committed"
        );
        Ok(LoadSummary {
            rows_inserted,
            stats,
            peak_memory_mb,
        })
    }

    /// Discard everything sent for this load
    pub async fn abort(self, reason: &str) -> BatchStats {
        let stats = self.batcher.stats();
        info!(table = %self.table, rows_discarded = self.rows_sent, reason, "Load rolled back");
        self.sink.abort(reason).await;
        stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn loader(
        factory: &MemorySinkFactory,
        settings: LoaderSettings,
        cancel: CancellationToken,
    ) -> BulkLoader {
        let sink = factory.open("orders", &["ordrenr"]).await.unwrap();
        BulkLoader::new(
            "orders",
            sink,
            BufferPool::new(4096, 2),
            &settings,
            None,
            cancel,
        )
    }

    fn small_batches() -> LoaderSettings {
        LoaderSettings {
            batch: BatchSettings {
                initial_rows: 2,
                min_rows: 1,
                max_rows: 8,
                grow_every_chunks: 100,
                shrink_after_stalls: 10,
            },
            row_reserve_bytes: 16,
            drain_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_rows_commit_in_source_order() {
        let factory = MemorySinkFactory::new();
        let mut loader = loader(&factory, small_batches(), CancellationToken::new()).await;
        for n in 1..=5 {
            loader.write_row(&[ColumnValue::Integer(n)]).await.unwrap();
        }
        assert_eq!(loader.rows_sent(), 4);

        let summary = loader.finish().await.unwrap();
        assert_eq!(summary.rows_inserted, 5);
        assert_eq!(summary.stats.chunks_written, 3);
        let rows: Vec<_> = factory
            .rows("orders")
            .into_iter()
            .map(|r| r[0].clone().unwrap())
            .collect();
        assert_eq!(rows, vec!["1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_buffer_capacity_triggers_flush() {
        let factory = MemorySinkFactory::new();
        let settings = LoaderSettings {
            row_reserve_bytes: 4090,
            ..LoaderSettings::default()
        };
        let pool = BufferPool::new(4096, 1);
        let sink = factory.open("orders", &["ordrenr"]).await.unwrap();
        let mut loader = BulkLoader::new(
            "orders",
            sink,
            Arc::clone(&pool),
            &settings,
            None,
            CancellationToken::new(),
        );
        loader
            .write_row(&[ColumnValue::Integer(123_456_789)])
            .await
            .unwrap();
        assert_eq!(loader.rows_sent(), 1);
        assert_eq!(pool.outstanding(), 0);
        loader.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_saturation_records_stalls() {
        let factory = MemorySinkFactory::with_behavior(MemorySinkBehavior {
            saturation: Saturation::Always,
            ..MemorySinkBehavior::default()
        });
        let mut loader = loader(&factory, small_batches(), CancellationToken::new()).await;
        for n in 0..6 {
            loader.write_row(&[ColumnValue::Integer(n)]).await.unwrap();
        }
        let summary = loader.finish().await.unwrap();
        assert_eq!(summary.rows_inserted, 6);
        assert_eq!(summary.stats.stalls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_is_fatal() {
        let factory = MemorySinkFactory::with_behavior(MemorySinkBehavior {
            saturation: Saturation::Always,
            never_drains: true,
            ..MemorySinkBehavior::default()
        });
        let mut loader = loader(&factory, small_batches(), CancellationToken::new()).await;
        loader.write_row(&[ColumnValue::Integer(1)]).await.unwrap();
        let err = loader
            .write_row(&[ColumnValue::Integer(2)])
            .await
            .unwrap_err();
        assert_eq!(err.category(), "backpressure-timeout");

        loader.abort("backpressure").await;
        let table = factory.table("orders").unwrap();
        assert!(table.rows.is_empty());
        assert_eq!(table.aborts, vec!["backpressure"]);
    }

    #[tokio::test]
    async fn test_cancellation_keeps_encoded_rows() {
        let factory = MemorySinkFactory::new();
        let cancel = CancellationToken::new();
        let mut loader = loader(&factory, small_batches(), cancel.clone()).await;
        loader.write_row(&[ColumnValue::Integer(1)]).await.unwrap();
        cancel.cancel();
        let err = loader
            .write_row(&[ColumnValue::Integer(2)])
            .await
            .unwrap_err();
        assert!(err.is_aborted());

        let summary = loader.finish().await.unwrap();
        assert_eq!(summary.rows_inserted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_drain_delivers_parked_chunk_on_finish() {
        let factory = MemorySinkFactory::with_behavior(MemorySinkBehavior {
            saturation: Saturation::Always,
            drain_delay: Duration::from_secs(1),
            ..MemorySinkBehavior::default()
        });
        let cancel = CancellationToken::new();
        let mut loader = loader(&factory, small_batches(), cancel.clone()).await;
        loader.write_row(&[ColumnValue::Integer(1)]).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = loader
            .write_row(&[ColumnValue::Integer(2)])
            .await
            .unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(loader.rows_sent(), 0);

        let summary = loader.finish().await.unwrap();
        assert_eq!(summary.rows_inserted, 2);
    }
}
