//! Process memory guard
//!
//! Samples resident memory every few chunks. Crossing the warn threshold logs once; crossing
//! the abort threshold ends the run with `heap-limit-exceeded`.

use sysinfo::{Pid, System};
use tracing::{debug, warn};

use crate::error::{IngestError, LimitKind, Result};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Source of process memory readings
pub trait MemorySampler: Send {
    /// Resident memory in bytes, `None` when it cannot be read
    fn sample_bytes(&mut self) -> Option<u64>;
}

/// Reads this process's resident memory through `sysinfo`
pub struct ProcessMemorySampler {
    system: System,
    pid: Option<Pid>,
}

impl ProcessMemorySampler {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| warn!(error = e, "Cannot resolve own pid, heap guard disabled"))
            .ok();
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for ProcessMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for ProcessMemorySampler {
    fn sample_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        if !self.system.refresh_process(pid) {
            return None;
        }
        self.system.process(pid).map(|process| process.memory())
    }
}

pub struct HeapGuard {
    sampler: Box<dyn MemorySampler>,
    check_every_chunks: u64,
    warn_bytes: u64,
    abort_bytes: u64,
    chunks_seen: u64,
    peak_bytes: u64,
    warned: bool,
}

impl HeapGuard {
    pub fn new(
        sampler: Box<dyn MemorySampler>,
        check_every_chunks: u64,
        warn_mb: u64,
        abort_mb: u64,
    ) -> Self {
        Self {
            sampler,
            check_every_chunks: check_every_chunks.max(1),
            warn_bytes: warn_mb.saturating_mul(BYTES_PER_MB),
            abort_bytes: abort_mb.saturating_mul(BYTES_PER_MB),
            chunks_seen: 0,
            peak_bytes: 0,
            warned: false,
        }
    }

    /// Call once per written chunk
    pub fn on_chunk(&mut self) -> Result<()> {
        self.chunks_seen += 1;
        if self.chunks_seen % self.check_every_chunks != 0 {
            return Ok(());
        }
        self.check()
    }

    /// Sample now, regardless of the chunk cadence
    pub fn check(&mut self) -> Result<()> {
        let Some(used) = self.sampler.sample_bytes() else {
            return Ok(());
        };
        self.peak_bytes = self.peak_bytes.max(used);
        debug!(used_mb = used / BYTES_PER_MB, "Heap sample");

        if used > self.abort_bytes {
            return Err(IngestError::limit(
                LimitKind::HeapLimit,
                format!(
                    "process uses {} MB, limit is {} MB",
                    used / BYTES_PER_MB,
                    self.abort_bytes / BYTES_PER_MB
                ),
            ));
        }
        if used > self.warn_bytes && !self.warned {
            self.warned = true;
            warn!(
                used_mb = used / BYTES_PER_MB,
                warn_mb = self.warn_bytes / BYTES_PER_MB,
                limit_mb = self.abort_bytes / BYTES_PER_MB,
                "Process memory above warning threshold"
            );
        }
        Ok(())
    }

    /// Highest sample seen, in MB
    pub fn peak_mb(&self) -> Option<u64> {
        (self.peak_bytes > 0).then_some(self.peak_bytes / BYTES_PER_MB)
    }
}
