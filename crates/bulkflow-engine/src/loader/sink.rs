//! Chunk sinks
//!
//! A sink receives encoded chunks for one table load. [`ChunkSink::offer`] never blocks: a
//! saturated sink hands the chunk back and the loader waits in
//! [`ChunkSink::write_when_drained`]. Rows become visible only when the sink is finished.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::encoder::decode_chunk;
use crate::error::{IngestError, Result};

/// Outcome of a non-blocking offer
#[derive(Debug)]
pub enum Offer {
    Accepted,
    /// The sink is full; the chunk is handed back untouched
    Saturated(Bytes),
}

#[async_trait]
pub trait ChunkSink: Send {
    fn offer(&mut self, chunk: Bytes) -> Result<Offer>;

    /// Wait until the sink can take `chunk`, then hand it over
    async fn write_when_drained(&mut self, chunk: Bytes) -> Result<()>;

    /// Commit everything sent; returns the number of rows committed
    async fn finish(self: Box<Self>) -> Result<u64>;

    /// Discard everything sent
    async fn abort(self: Box<Self>, reason: &str);
}

#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(&self, table: &str, columns: &[&str]) -> Result<Box<dyn ChunkSink>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Saturation {
    #[default]
    Never,
    /// Every n-th offer is refused
    EveryNth(u64),
    Always,
}

/// How in-memory sinks simulate a slow database
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySinkBehavior {
    pub saturation: Saturation,
    pub drain_delay: Duration,
    /// A saturated sink never drains (exercises the drain timeout)
    pub never_drains: bool,
    pub fail_on_finish: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub loads: u64,
    pub aborts: Vec<String>,
}

type Tables = Arc<Mutex<HashMap<String, MemoryTable>>>;

/// In-process sink factory for dry runs and tests
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    tables: Tables,
    behavior: MemorySinkBehavior,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MemorySinkBehavior) -> Self {
        Self {
            tables: Tables::default(),
            behavior,
        }
    }

    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.tables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Committed rows of `name`, decoded
    pub fn rows(&self, name: &str) -> Vec<Vec<Option<String>>> {
        self.table(name).map(|t| t.rows).unwrap_or_default()
    }
}

#[async_trait]
impl SinkFactory for MemorySinkFactory {
    async fn open(&self, table: &str, columns: &[&str]) -> Result<Box<dyn ChunkSink>> {
        {
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = tables.entry(table.to_string()).or_default();
            entry.columns = columns.iter().map(|c| c.to_string()).collect();
        }
        Ok(Box::new(MemorySink {
            table: table.to_string(),
            tables: Arc::clone(&self.tables),
            behavior: self.behavior,
            pending: Vec::new(),
            offers: 0,
        }))
    }
}

pub struct MemorySink {
    table: String,
    tables: Tables,
    behavior: MemorySinkBehavior,
    pending: Vec<Bytes>,
    offers: u64,
}

#[async_trait]
impl ChunkSink for MemorySink {
    fn offer(&mut self, chunk: Bytes) -> Result<Offer> {
        self.offers += 1;
        let saturated = match self.behavior.saturation {
            Saturation::Never => false,
            Saturation::Always => true,
            Saturation::EveryNth(n) => n > 0 && self.offers % n == 0,
        };
        if saturated {
            return Ok(Offer::Saturated(chunk));
        }
        self.pending.push(chunk);
        Ok(Offer::Accepted)
    }

    async fn write_when_drained(&mut self, chunk: Bytes) -> Result<()> {
        if self.behavior.never_drains {
            std::future::pending::<()>().await;
        }
        if !self.behavior.drain_delay.is_zero() {
            tokio::time::sleep(self.behavior.drain_delay).await;
        }
        self.pending.push(chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64> {
        if self.behavior.fail_on_finish {
            return Err(IngestError::Sink(format!(
                "simulated failure committing {}",
                self.table
            )));
        }
        let rows: Vec<_> = self.pending.iter().flat_map(|c| decode_chunk(c)).collect();
        let count = rows.len() as u64;
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = tables.entry(self.table.clone()).or_default();
        entry.rows.extend(rows);
        entry.loads += 1;
        Ok(count)
    }

    async fn abort(self: Box<Self>, reason: &str) {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables
            .entry(self.table.clone())
            .or_default()
            .aborts
            .push(reason.to_string());
    }
}
