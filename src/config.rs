//! Compile-time policy knobs for the logging runtime.
//!
//! These values are policy, not contract: tests must not depend on the exact
//! numbers, only on the orderings they induce (a full output buffer blocks
//! harder than low work, which naps shorter than idle).

/// Where the runtime writes when no file was configured.
pub const DEFAULT_LOG_FILE: &str = "/tmp/blitzlog.clog";

/// Capacity of each per-thread staging ring, in bytes.
pub const STAGING_BUFFER_SIZE: usize = 1 << 20;

/// Capacity of each of the two output buffers handed to the encoder.
pub const OUTPUT_BUFFER_SIZE: usize = 1 << 22;

/// Upper bound on staged bytes handed to the encoder per batch. The consumer
/// cursor advances after every batch, so a smaller value frees staging space
/// sooner at the cost of more encoder calls.
pub const RELEASE_THRESHOLD: usize = 1 << 17;

/// How long the worker sleeps when every staging buffer was empty.
pub const POLL_INTERVAL_NO_WORK_US: u64 = 100;

/// Nap length while an async write is in flight and little was consumed.
/// Zero disables the nap entirely.
pub const POLL_INTERVAL_DURING_LOW_WORK_US: u64 = 1;

/// A scan pass that consumed at most this many bytes counts as low work.
pub const LOW_WORK_THRESHOLD: u64 = 1 << 14;

/// Open the output file with `O_DIRECT` and pad writes to sector multiples.
pub const DIRECT_IO: bool = false;

/// Alignment unit for output buffers and direct-I/O padding.
pub const SECTOR_SIZE: usize = 512;

/// Bucket count of the consumer peek-size histogram.
pub const PEEK_HIST_BUCKETS: usize = 20;

/// Bucket count of the producer blocked-duration histogram (10 ns per
/// bucket, last bucket saturating).
#[cfg(feature = "producer-stats")]
pub const BLOCKED_HIST_BUCKETS: usize = 64;
