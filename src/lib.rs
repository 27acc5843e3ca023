//! # blitzlog
//!
//! A low-latency binary logging runtime. Application threads serialize log
//! events into per-thread lock-free staging rings at nanosecond-scale cost;
//! a single background worker drains the rings, compresses records into a
//! compact binary stream, and writes it to disk with double-buffered
//! asynchronous I/O.
//!
//! ## Architecture
//!
//! ```text
//! [app threads] -> log_event! -> [staging rings] -> [worker] -> [encoder]
//!                                                       |
//!                                            double-buffered io_uring
//!                                                       v
//!                                                  [log file]
//! ```
//!
//! Each thread owns exactly one staging ring, created on first use and
//! freed by the worker after the thread exits and the ring drains. Call
//! sites register static metadata once and refer to it by id; the worker
//! persists that dictionary ahead of the records that reference it, so a
//! log file is always self-describing.
//!
//! ## Example
//!
//! ```no_run
//! use blitzlog::{log_event, LogLevel};
//!
//! blitzlog::set_log_file("/tmp/service.clog").expect("open log");
//! blitzlog::set_log_level(LogLevel::Debug);
//!
//! let request_id = 7u64;
//! log_event!(Notice, "accepted request {} from {}", request_id, "10.0.0.4");
//!
//! // Block until everything committed so far is on disk.
//! blitzlog::sync();
//! println!("{}", blitzlog::get_stats());
//! ```
//!
//! ## Guarantees
//!
//! - Events from one thread appear in the output in commit order; no order
//!   is promised across threads.
//! - [`sync`] returns only after every event committed before the call has
//!   been handed to the kernel and the write completed.
//! - The producer path never fails visibly: when a ring is full it spins
//!   until the worker catches up.
//!
//! Linux only: the write path is built on io_uring.

pub mod config;
pub mod cycles;
pub mod encode;
pub mod level;
pub mod metrics;
pub mod record;
pub mod runtime;

pub use level::LogLevel;
pub use metrics::MetricsSnapshot;
pub use record::{LogArg, RecordHeader};
pub use runtime::{
    get_histograms, get_stats, log_level, metrics_snapshot, preallocate, set_log_file,
    set_log_level, staging_buffer_count, sync, CallSite, ParamKind, SetLogFileError,
};
