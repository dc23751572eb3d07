// Per-operation latency statistics.
//
// Each operation fingerprint keeps an exponentially weighted running
// average: `avg' = (avg * 4 + sample) / 5`, seeded with the first sample.
// The overall average is the arithmetic mean of the per-operation
// averages, refreshed periodically rather than on every record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Fingerprint of one operation, derived from its SQL text.
pub fn operation_hash(fingerprint: &str) -> u64 {
    let digest = Sha256::digest(fingerprint.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest window"))
}

/// Running statistics for one operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationStats {
    pub running_average_nanos: u64,
    pub samples: u64,
    #[serde(skip)]
    pub last_recorded: Instant,
}

impl OperationStats {
    fn first(sample_nanos: u64) -> Self {
        Self {
            running_average_nanos: sample_nanos,
            samples: 1,
            last_recorded: Instant::now(),
        }
    }

    fn record(&mut self, sample_nanos: u64) {
        self.running_average_nanos =
            (self.running_average_nanos.saturating_mul(4) + sample_nanos) / 5;
        self.samples += 1;
        self.last_recorded = Instant::now();
    }
}

/// Registry of per-operation averages plus the refreshed overall average.
pub struct StatsRegistry {
    operations: DashMap<u64, OperationStats>,
    overall_average_nanos: AtomicU64,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            operations: DashMap::new(),
            overall_average_nanos: AtomicU64::new(0),
        }
    }

    /// Records one measured execution.
    pub fn record(&self, op_hash: u64, elapsed: Duration) {
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.operations
            .entry(op_hash)
            .and_modify(|s| s.record(nanos))
            .or_insert_with(|| OperationStats::first(nanos));
    }

    pub fn average_nanos(&self, op_hash: u64) -> Option<u64> {
        self.operations.get(&op_hash).map(|s| s.running_average_nanos)
    }

    pub fn overall_average_nanos(&self) -> u64 {
        self.overall_average_nanos.load(Ordering::SeqCst)
    }

    /// Slow when the operation's average exceeds twice the overall average
    /// and the overall average itself is above one millisecond.
    pub fn is_slow(&self, op_hash: u64) -> bool {
        let overall = self.overall_average_nanos();
        if overall <= 1_000_000 {
            return false;
        }
        match self.average_nanos(op_hash) {
            Some(avg) => avg > overall.saturating_mul(2),
            None => false,
        }
    }

    /// Recomputes the overall average and drops operations idle beyond
    /// `idle_timeout`. Run by the global averager task.
    pub fn refresh_overall(&self, idle_timeout: Duration) {
        self.operations
            .retain(|_, s| s.last_recorded.elapsed() <= idle_timeout);

        let (sum, count) = self
            .operations
            .iter()
            .fold((0u128, 0u64), |(sum, count), entry| {
                (sum + entry.running_average_nanos as u128, count + 1)
            });
        let overall = if count == 0 { 0 } else { (sum / count as u128) as u64 };
        self.overall_average_nanos.store(overall, Ordering::SeqCst);
    }

    pub fn tracked_operations(&self) -> usize {
        self.operations.len()
    }
}
