//! Process-wide runtime coordinator.
//!
//! Owns the staging buffer list, the call-site registry, the output file,
//! and the compression worker. Initialized on first use; producers reach it
//! through a thread-local handle whose drop glue flags their ring for
//! deferred deallocation.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use zerocopy::IntoBytes;

use crate::config::{
    DEFAULT_LOG_FILE, DIRECT_IO, OUTPUT_BUFFER_SIZE, PEEK_HIST_BUCKETS, STAGING_BUFFER_SIZE,
};
use crate::cycles;
use crate::encode::OutputBuffer;
use crate::level::LogLevel;
use crate::metrics::{MetricsSnapshot, WorkerMetrics};
use crate::record::{LogArg, RecordHeader};
use crate::runtime::registry::{CallSite, ParamKind, Registry, UNREGISTERED_ID};
use crate::runtime::staging::{StagingBuffer, StagingProducer};
use crate::runtime::worker::{self, WorkerBuffers};

/// Error surfaced by [`set_log_file`]. The previous file stays active.
#[derive(Debug)]
pub enum SetLogFileError {
    Open(io::Error),
}

pub(crate) struct BufferList {
    pub(crate) list: Vec<std::sync::Arc<StagingBuffer>>,
    next_id: u32,
}

pub(crate) struct ControlState {
    pub(crate) sync_requested: bool,
    /// Bumped every time the worker reports an empty, fully drained pass.
    pub(crate) sync_epoch: u64,
}

pub(crate) struct Control {
    pub(crate) mu: Mutex<ControlState>,
    pub(crate) work_added: Condvar,
    pub(crate) hint_queue_emptied: Condvar,
    /// Mirrors the flag guarded by `mu` so the worker can poll it without
    /// taking the lock every iteration.
    pub(crate) should_exit: AtomicBool,
}

struct OutputState {
    file: File,
    worker: Option<JoinHandle<WorkerBuffers>>,
}

pub(crate) struct Runtime {
    pub(crate) buffers: Mutex<BufferList>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) control: Control,
    pub(crate) metrics: WorkerMetrics,
    pub(crate) cycle_at_thread_start: AtomicU64,
    output: Mutex<OutputState>,
    log_level: AtomicU8,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

pub(crate) fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(Runtime::new)
}

fn open_log_file(path: &str) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).write(true);
    if DIRECT_IO {
        options.custom_flags(libc::O_DIRECT);
    }
    options.open(path)
}

fn alloc_output_buffer() -> OutputBuffer {
    match OutputBuffer::alloc(OUTPUT_BUFFER_SIZE) {
        Some(buf) => buf,
        None => {
            eprintln!("blitzlog: could not allocate the output buffers; quitting");
            process::exit(1);
        }
    }
}

fn spawn_worker(bufs: WorkerBuffers) -> JoinHandle<WorkerBuffers> {
    let spawned = thread::Builder::new()
        .name("blitzlog-worker".to_string())
        .spawn(move || worker::run(runtime(), bufs));
    match spawned {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("blitzlog: could not start the compression worker: {e}");
            process::exit(1);
        }
    }
}

impl Runtime {
    fn new() -> Runtime {
        let file = match open_log_file(DEFAULT_LOG_FILE) {
            Ok(file) => file,
            Err(e) => {
                eprintln!(
                    "blitzlog: could not open the default log file \"{DEFAULT_LOG_FILE}\": {e}. \
                     Check permissions or call set_log_file() with a writable path first."
                );
                process::exit(1);
            }
        };
        let a = alloc_output_buffer();
        let b = alloc_output_buffer();

        let runtime = Runtime {
            buffers: Mutex::new(BufferList {
                list: Vec::new(),
                next_id: 0,
            }),
            registry: Mutex::new(Registry::new()),
            control: Control {
                mu: Mutex::new(ControlState {
                    sync_requested: false,
                    sync_epoch: 0,
                }),
                work_added: Condvar::new(),
                hint_queue_emptied: Condvar::new(),
                should_exit: AtomicBool::new(false),
            },
            metrics: WorkerMetrics::new(),
            cycle_at_thread_start: AtomicU64::new(0),
            output: Mutex::new(OutputState { file, worker: None }),
            log_level: AtomicU8::new(LogLevel::Notice as u8),
        };

        // The worker blocks in runtime() until this constructor returns.
        let handle = spawn_worker(WorkerBuffers { a, b });
        runtime.output.lock().unwrap().worker = Some(handle);
        runtime
    }

    /// Raw fd and append offset for the worker's write path. Only called
    /// while exactly one worker exists.
    pub(crate) fn output_write_target(&self) -> (RawFd, u64) {
        let out = self.output.lock().unwrap();
        let len = out.file.metadata().map(|m| m.len()).unwrap_or(0);
        (out.file.as_raw_fd(), len)
    }

    fn allocate_staging_buffer(&self) -> StagingProducer {
        let mut buffers = self.buffers.lock().unwrap();
        let id = buffers.next_id;
        buffers.next_id += 1;
        let (producer, shared) = StagingBuffer::new(id, STAGING_BUFFER_SIZE);
        buffers.list.push(shared);
        producer
    }
}

thread_local! {
    /// Producer handle for this thread; the drop glue on thread exit flags
    /// the ring so the worker frees it after draining.
    static PRODUCER: RefCell<Option<StagingProducer>> = const { RefCell::new(None) };
}

fn with_producer<R>(f: impl FnOnce(&mut StagingProducer) -> R) -> Option<R> {
    PRODUCER
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            let producer = slot.get_or_insert_with(|| runtime().allocate_staging_buffer());
            f(producer)
        })
        .ok()
}

/// Allocates this thread's staging buffer up front so the first log call
/// does not pay for it.
pub fn preallocate() {
    let _ = with_producer(|_| ());
}

/// Minimum severity admitted by the logging macro.
pub fn log_level() -> LogLevel {
    LogLevel::from_u8(runtime().log_level.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    runtime().log_level.store(level as u8, Ordering::Relaxed);
}

/// Serializes one event into the calling thread's staging buffer. Called by
/// `log_event!` after the level check; registers the site on first use.
pub fn log_site(site: &'static CallSite, id_cache: &AtomicU32, args: &[&dyn LogArg]) {
    let mut id = id_cache.load(Ordering::Relaxed);
    if id == UNREGISTERED_ID {
        let kinds: Vec<ParamKind> = args.iter().map(|a| a.kind()).collect();
        id = runtime().registry.lock().unwrap().register(site, &kinds);
        id_cache.store(id, Ordering::Relaxed);
    }

    let timestamp = cycles::rdtsc();
    let payload_len: usize = args.iter().map(|a| a.size()).sum();
    let total = RecordHeader::SIZE + payload_len;

    let _ = with_producer(|producer| {
        debug_assert!(total < producer.buffer().capacity());
        let slot = producer.reserve(total);
        let header = RecordHeader {
            site_id: id,
            payload_len: payload_len as u32,
            timestamp,
        };
        slot[..RecordHeader::SIZE].copy_from_slice(header.as_bytes());
        let mut at = RecordHeader::SIZE;
        for arg in args {
            at += arg.write(&mut slot[at..]);
        }
        producer.commit(total);
    });
}

/// Blocks until everything committed before this call is written out.
///
/// A non-quiescent checkpoint: records committed by other threads while this
/// waits may be persisted as well.
pub fn sync() {
    let rt = runtime();
    let mut ctl = rt.control.mu.lock().unwrap();
    let observed = ctl.sync_epoch;
    ctl.sync_requested = true;
    rt.control.work_added.notify_all();
    while ctl.sync_epoch == observed {
        ctl = rt.control.hint_queue_emptied.wait(ctl).unwrap();
    }
}

/// Redirects output to `path`.
///
/// Syncs the current file, stops and joins the worker, swaps the file,
/// resets the dictionary watermark so the new file starts with a complete
/// dictionary, then relaunches the worker. Not safe to call concurrently
/// with log production.
pub fn set_log_file(path: &str) -> Result<(), SetLogFileError> {
    let new_file = open_log_file(path).map_err(SetLogFileError::Open)?;
    let rt = runtime();

    sync();

    {
        let ctl = rt.control.mu.lock().unwrap();
        rt.control.should_exit.store(true, Ordering::Release);
        rt.control.work_added.notify_all();
        drop(ctl);
    }
    let handle = rt.output.lock().unwrap().worker.take();
    let bufs = match handle.map(JoinHandle::join) {
        Some(Ok(bufs)) => bufs,
        // A lost worker also lost its buffers; start over with fresh ones.
        _ => WorkerBuffers {
            a: alloc_output_buffer(),
            b: alloc_output_buffer(),
        },
    };

    {
        let mut out = rt.output.lock().unwrap();
        out.file = new_file; // the previous file closes here
    }
    rt.registry.lock().unwrap().next_persist = 0;
    rt.control.should_exit.store(false, Ordering::Release);

    let handle = spawn_worker(bufs);
    rt.output.lock().unwrap().worker = Some(handle);
    Ok(())
}

/// Number of live staging buffers, drained-but-not-yet-freed included.
pub fn staging_buffer_count() -> usize {
    runtime().buffers.lock().unwrap().list.len()
}

pub fn metrics_snapshot() -> MetricsSnapshot {
    runtime().metrics.snapshot()
}

/// Human-readable throughput and compression figures. Issues an fdatasync on
/// the output file and charges the elapsed time to the disk-I/O upper bound.
pub fn get_stats() -> String {
    let rt = runtime();

    let start = cycles::rdtsc();
    let sync_result = rt.output.lock().unwrap().file.sync_data();
    let stop = cycles::rdtsc();
    rt.metrics
        .cycles_disk_io_upper_bound
        .fetch_add(stop.wrapping_sub(start), Ordering::Relaxed);

    let m = rt.metrics.snapshot();
    let output_time = cycles::to_seconds(m.cycles_disk_io_upper_bound);
    let compress_time = cycles::to_seconds(m.cycles_compressing);
    let active_time = cycles::to_seconds(m.cycles_active);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Wrote {} events ({:.2} MB) across {} flushes",
        m.logs_processed,
        m.total_bytes_written as f64 / 1e6,
        m.num_aio_writes_completed,
    );
    if let Err(e) = sync_result {
        let _ = writeln!(out, "fdatasync on the output file failed: {e}");
    }
    let _ = writeln!(
        out,
        "Disk I/O time (upper bound): {output_time:.3} s; compression time: {compress_time:.3} s",
    );

    let started = rt.cycle_at_thread_start.load(Ordering::Relaxed);
    if started != 0 {
        let uptime = cycles::to_seconds(cycles::rdtsc().wrapping_sub(started));
        if uptime > 0.0 {
            let _ = writeln!(
                out,
                "Worker active for {:.3} of {:.3} s ({:.1}%)",
                active_time,
                uptime,
                100.0 * active_time / uptime,
            );
        }
    }
    if m.total_bytes_written > 0 {
        let _ = writeln!(
            out,
            "Compression ratio {:.2}x ({} bytes in, {} bytes out, {} pad bytes)",
            m.total_bytes_read as f64 / m.total_bytes_written as f64,
            m.total_bytes_read,
            m.total_bytes_written,
            m.pad_bytes_written,
        );
    }
    out
}

/// Peek-size distribution plus per-buffer producer statistics.
pub fn get_histograms() -> String {
    let rt = runtime();
    let m = rt.metrics.snapshot();
    let mut out = String::new();

    out.push_str("Distribution of staging buffer peek sizes\n");
    for (i, count) in m.staging_peek_dist.iter().enumerate() {
        let _ = writeln!(
            out,
            "\t{:2} - {:2}%: {}",
            i * 100 / PEEK_HIST_BUCKETS,
            (i + 1) * 100 / PEEK_HIST_BUCKETS,
            count,
        );
    }

    let buffers = rt.buffers.lock().unwrap();
    for sb in buffers.list.iter() {
        let _ = writeln!(out, "Thread buffer {}:", sb.id());
        let _ = writeln!(
            out,
            "\tAllocations   : {}",
            sb.num_allocations.load(Ordering::Relaxed),
        );
        let _ = writeln!(
            out,
            "\tTimes blocked : {}",
            sb.num_times_producer_blocked.load(Ordering::Relaxed),
        );
        #[cfg(feature = "producer-stats")]
        {
            let blocked = sb.num_times_producer_blocked.load(Ordering::Relaxed);
            if blocked > 0 {
                let avg_ns = cycles::to_nanoseconds(
                    sb.cycles_producer_blocked.load(Ordering::Relaxed),
                ) / blocked;
                let _ = writeln!(out, "\tAvg block (ns): {avg_ns}");
                out.push_str("\tBlock distribution\n");
                for (i, bucket) in sb.blocked_dist.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "\t\t{:4} - {:4} ns: {}",
                        i * 10,
                        (i + 1) * 10,
                        bucket.load(Ordering::Relaxed),
                    );
                }
            }
        }
    }
    drop(buffers);

    #[cfg(not(feature = "producer-stats"))]
    out.push_str("Detailed producer stats compiled out; enable the producer-stats feature\n");

    out
}
