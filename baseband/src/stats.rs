//! Worker Statistics
//!
//! Per-worker, per-stage accumulating counters. Append-only on the hot path
//! (relaxed atomics, cache-padded against false sharing), read only after
//! the pipeline drains. Non-safety-critical.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;
use num_traits::FromPrimitive;
use tracing::info;

use common::DoerType;

/// Number of duration breakdown buckets per stage: total, gather/prepare,
/// compute.
pub const STAT_BREAKDOWN: usize = 3;

/// Accumulated task durations of one (worker, stage) pair. Unit =
/// nanoseconds.
#[derive(Default)]
pub struct DurationStat {
    task_duration: [AtomicU64; STAT_BREAKDOWN],
    task_count: AtomicU64,
}

impl DurationStat {
    /// Add one completed task with its breakdown durations
    pub fn record(&self, durations: [u64; STAT_BREAKDOWN]) {
        for (bucket, d) in self.task_duration.iter().zip(durations) {
            bucket.fetch_add(d, Ordering::Relaxed);
        }
        self.task_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed task count
    pub fn count(&self) -> u64 {
        self.task_count.load(Ordering::Relaxed)
    }

    /// Accumulated nanoseconds of one breakdown bucket
    pub fn duration(&self, breakdown: usize) -> u64 {
        self.task_duration[breakdown].load(Ordering::Relaxed)
    }
}

/// Nanoseconds elapsed since `start`, saturating into u64.
pub fn elapsed_ns(start: Instant) -> u64 {
    start.elapsed().as_nanos() as u64
}

/// All worker statistics: one `DurationStat` per (worker, doer type).
pub struct Stats {
    workers: Vec<Vec<CachePadded<DurationStat>>>,
}

impl Stats {
    /// Allocate counters for `num_workers` workers
    pub fn new(num_workers: usize) -> Self {
        let workers = (0..num_workers)
            .map(|_| (0..DoerType::COUNT).map(|_| CachePadded::new(DurationStat::default())).collect())
            .collect();
        Self { workers }
    }

    /// The counter used by worker `tid` for `doer_type`
    pub fn duration_stat(&self, doer_type: DoerType, tid: usize) -> &DurationStat {
        &self.workers[tid][doer_type as usize]
    }

    /// Total tasks of one doer type across all workers
    pub fn total_task_count(&self, doer_type: DoerType) -> u64 {
        self.workers.iter().map(|w| w[doer_type as usize].count()).sum()
    }

    /// Log a per-stage summary. Call only after the pipeline has drained.
    pub fn print_summary(&self) {
        info!("Worker statistics:");
        for d in 0..DoerType::COUNT {
            let doer_type = DoerType::from_usize(d).expect("doer type index in range");
            let count = self.total_task_count(doer_type);
            if count == 0 {
                continue;
            }
            let total_ns: u64 =
                self.workers.iter().map(|w| w[d].duration(0)).sum();
            let compute_ns: u64 =
                self.workers.iter().map(|w| w[d].duration(2)).sum();
            info!(
                "  {:?}: {} tasks, {:.1} us/task total, {:.1} us/task compute",
                doer_type,
                count,
                total_ns as f64 / count as f64 / 1e3,
                compute_ns as f64 / count as f64 / 1e3,
            );
        }
    }
}
