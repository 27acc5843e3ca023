//! Worker-side metrics. No allocations, no locks, just atomics.
//!
//! All counters have a single writer (the compression worker) except the
//! disk-I/O upper bound, which `get_stats` also charges; relaxed atomics make
//! the cross-thread reads sound without slowing the writer down.

use core::sync::atomic::{AtomicU64, Ordering};
use std::ops::Sub;

use crate::config::PEEK_HIST_BUCKETS;

#[derive(Debug)]
pub struct WorkerMetrics {
    pub logs_processed: AtomicU64,
    pub total_bytes_read: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub pad_bytes_written: AtomicU64,
    pub num_aio_writes_completed: AtomicU64,
    pub num_compress_batches: AtomicU64,
    pub num_scan_passes: AtomicU64,
    pub num_low_work_sleeps: AtomicU64,
    pub cycles_active: AtomicU64,
    pub cycles_compressing: AtomicU64,
    pub cycles_disk_io_upper_bound: AtomicU64,
    /// Peek sizes bucketed as floor(bytes * buckets / capacity).
    pub staging_peek_dist: [AtomicU64; PEEK_HIST_BUCKETS],
}

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU64 = AtomicU64::new(0);

impl WorkerMetrics {
    pub const fn new() -> Self {
        Self {
            logs_processed: ZERO,
            total_bytes_read: ZERO,
            total_bytes_written: ZERO,
            pad_bytes_written: ZERO,
            num_aio_writes_completed: ZERO,
            num_compress_batches: ZERO,
            num_scan_passes: ZERO,
            num_low_work_sleeps: ZERO,
            cycles_active: ZERO,
            cycles_compressing: ZERO,
            cycles_disk_io_upper_bound: ZERO,
            staging_peek_dist: [ZERO; PEEK_HIST_BUCKETS],
        }
    }

    #[inline(always)]
    pub fn record_compress_batch(&self, cycles: u64) {
        self.num_compress_batches.fetch_add(1, Ordering::Relaxed);
        self.cycles_compressing.fetch_add(cycles, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_peek(&self, bytes: usize, capacity: usize) {
        let bucket = (bytes * PEEK_HIST_BUCKETS / capacity).min(PEEK_HIST_BUCKETS - 1);
        self.staging_peek_dist[bucket].fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_write_issued(&self, bytes: u64, pad: u64) {
        self.total_bytes_written.fetch_add(bytes, Ordering::Relaxed);
        self.pad_bytes_written.fetch_add(pad, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut dist = [0u64; PEEK_HIST_BUCKETS];
        for (out, bucket) in dist.iter_mut().zip(self.staging_peek_dist.iter()) {
            *out = bucket.load(Ordering::Relaxed);
        }
        MetricsSnapshot {
            logs_processed: self.logs_processed.load(Ordering::Relaxed),
            total_bytes_read: self.total_bytes_read.load(Ordering::Relaxed),
            total_bytes_written: self.total_bytes_written.load(Ordering::Relaxed),
            pad_bytes_written: self.pad_bytes_written.load(Ordering::Relaxed),
            num_aio_writes_completed: self.num_aio_writes_completed.load(Ordering::Relaxed),
            num_compress_batches: self.num_compress_batches.load(Ordering::Relaxed),
            num_scan_passes: self.num_scan_passes.load(Ordering::Relaxed),
            num_low_work_sleeps: self.num_low_work_sleeps.load(Ordering::Relaxed),
            cycles_active: self.cycles_active.load(Ordering::Relaxed),
            cycles_compressing: self.cycles_compressing.load(Ordering::Relaxed),
            cycles_disk_io_upper_bound: self.cycles_disk_io_upper_bound.load(Ordering::Relaxed),
            staging_peek_dist: dist,
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable copy of the counters, suitable for delta arithmetic between two
/// points in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub logs_processed: u64,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
    pub pad_bytes_written: u64,
    pub num_aio_writes_completed: u64,
    pub num_compress_batches: u64,
    pub num_scan_passes: u64,
    pub num_low_work_sleeps: u64,
    pub cycles_active: u64,
    pub cycles_compressing: u64,
    pub cycles_disk_io_upper_bound: u64,
    pub staging_peek_dist: [u64; PEEK_HIST_BUCKETS],
}

impl Sub for MetricsSnapshot {
    type Output = MetricsSnapshot;

    /// Elementwise difference, histogram included. Saturates so a snapshot
    /// pair taken across racing updates never panics.
    fn sub(self, other: MetricsSnapshot) -> MetricsSnapshot {
        let mut dist = [0u64; PEEK_HIST_BUCKETS];
        for (i, out) in dist.iter_mut().enumerate() {
            *out = self.staging_peek_dist[i].saturating_sub(other.staging_peek_dist[i]);
        }
        MetricsSnapshot {
            logs_processed: self.logs_processed.saturating_sub(other.logs_processed),
            total_bytes_read: self.total_bytes_read.saturating_sub(other.total_bytes_read),
            total_bytes_written: self
                .total_bytes_written
                .saturating_sub(other.total_bytes_written),
            pad_bytes_written: self.pad_bytes_written.saturating_sub(other.pad_bytes_written),
            num_aio_writes_completed: self
                .num_aio_writes_completed
                .saturating_sub(other.num_aio_writes_completed),
            num_compress_batches: self
                .num_compress_batches
                .saturating_sub(other.num_compress_batches),
            num_scan_passes: self.num_scan_passes.saturating_sub(other.num_scan_passes),
            num_low_work_sleeps: self
                .num_low_work_sleeps
                .saturating_sub(other.num_low_work_sleeps),
            cycles_active: self.cycles_active.saturating_sub(other.cycles_active),
            cycles_compressing: self.cycles_compressing.saturating_sub(other.cycles_compressing),
            cycles_disk_io_upper_bound: self
                .cycles_disk_io_upper_bound
                .saturating_sub(other.cycles_disk_io_upper_bound),
            staging_peek_dist: dist,
        }
    }
}
