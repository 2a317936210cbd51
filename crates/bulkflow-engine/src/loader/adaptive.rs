//! Adaptive rows-per-chunk target

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub initial_rows: usize,
    pub min_rows: usize,
    pub max_rows: usize,
    /// Consecutive stall-free chunks before the target grows
    pub grow_every_chunks: u32,
    /// Stalls since the last shrink that trigger the next one (strictly more than this)
    pub shrink_after_stalls: u32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            initial_rows: 5_000,
            min_rows: 500,
            max_rows: 50_000,
            grow_every_chunks: 8,
            shrink_after_stalls: 10,
        }
    }
}

/// Run-scoped batching statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub target_rows: usize,
    pub stalls: u64,
    pub stall_wait_ms: u64,
    pub chunks_written: u64,
    pub bytes_written: u64,
}

impl BatchStats {
    /// Combine the stats of tables loaded one after another
    pub fn merge(self, other: BatchStats) -> BatchStats {
        BatchStats {
            target_rows: other.target_rows,
            stalls: self.stalls + other.stalls,
            stall_wait_ms: self.stall_wait_ms + other.stall_wait_ms,
            chunks_written: self.chunks_written + other.chunks_written,
            bytes_written: self.bytes_written + other.bytes_written,
        }
    }
}

#[derive(Debug)]
pub struct AdaptiveBatcher {
    settings: BatchSettings,
    stats: BatchStats,
    clean_streak: u32,
    stalls_since_shrink: u32,
}

impl AdaptiveBatcher {
    pub fn new(settings: BatchSettings) -> Self {
        let initial = settings
            .initial_rows
            .max(settings.min_rows)
            .min(settings.max_rows)
            .max(1);
        Self {
            settings,
            stats: BatchStats {
                target_rows: initial,
                ..BatchStats::default()
            },
            clean_streak: 0,
            stalls_since_shrink: 0,
        }
    }

    pub fn target(&self) -> usize {
        self.stats.target_rows
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    /// Account for one written chunk and adjust the target
    pub fn record_chunk(&mut self, bytes: usize, stall: Option<Duration>) {
        self.stats.chunks_written += 1;
        self.stats.bytes_written += bytes as u64;

        match stall {
            None => {
                self.clean_streak += 1;
                if self.clean_streak >= self.settings.grow_every_chunks {
                    self.clean_streak = 0;
                    let current = self.stats.target_rows;
                    self.stats.target_rows =
                        (current + (current / 2).max(1)).min(self.settings.max_rows.max(1));
                }
            },
            Some(waited) => {
                self.clean_streak = 0;
                self.stats.stalls += 1;
                self.stats.stall_wait_ms += waited.as_millis() as u64;
                self.stalls_since_shrink += 1;
                if self.stalls_since_shrink > self.settings.shrink_after_stalls {
                    self.stalls_since_shrink = 0;
                    self.stats.target_rows =
                        (self.stats.target_rows / 2).max(self.settings.min_rows.max(1));
                }
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn settings() -> BatchSettings {
        BatchSettings {
            initial_rows: 1_000,
            min_rows: 100,
            max_rows: 4_000,
            grow_every_chunks: 4,
            shrink_after_stalls: 10,
        }
    }

    #[test]
    fn test_grows_without_backpressure_until_cap() {
        let mut batcher = AdaptiveBatcher::new(settings());
        let mut targets = vec![batcher.target()];
        for _ in 0..20 {
            batcher.record_chunk(100, None);
            targets.push(batcher.target());
        }
        assert_eq!(targets[4], 1_500);
        assert_eq!(targets[8], 2_250);
        assert_eq!(*targets.last().unwrap(), 4_000);
        assert!(targets.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_shrinks_after_more_than_ten_stalls() {
        let mut batcher = AdaptiveBatcher::new(settings());
        for _ in 0..10 {
            batcher.record_chunk(100, Some(Duration::from_millis(5)));
        }
        assert_eq!(batcher.target(), 1_000);
        batcher.record_chunk(100, Some(Duration::from_millis(5)));
        assert_eq!(batcher.target(), 500);

        let stats = batcher.stats();
        assert_eq!(stats.stalls, 11);
        assert_eq!(stats.stall_wait_ms, 55);
        assert_eq!(stats.chunks_written, 11);
    }

    #[test]
    fn test_shrink_is_floored() {
        let mut batcher = AdaptiveBatcher::new(settings());
        for _ in 0..200 {
            batcher.record_chunk(10, Some(Duration::from_millis(1)));
        }
        assert_eq!(batcher.target(), 100);
    }

    #[test]
    fn test_stall_resets_growth_streak() {
        let mut batcher = AdaptiveBatcher::new(settings());
        for _ in 0..3 {
            batcher.record_chunk(10, None);
        }
        batcher.record_chunk(10, Some(Duration::from_millis(1)));
        for _ in 0..3 {
            batcher.record_chunk(10, None);
        }
        assert_eq!(batcher.target(), 1_000);
        batcher.record_chunk(10, None);
        assert_eq!(batcher.target(), 1_500);
    }

    #[test]
    fn test_initial_target_is_clamped() {
        let batcher = AdaptiveBatcher::new(BatchSettings {
            initial_rows: 10,
            ..settings()
        });
        assert_eq!(batcher.target(), 100);
    }
}
