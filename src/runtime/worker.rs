//! The compression worker: a single background thread that drains every
//! staging buffer through the encoder and writes the result with
//! double-buffered asynchronous I/O.
//!
//! Backpressure is a three-way sleep policy. When the encoder's output is
//! full the worker blocks on write completion (nothing else can make
//! progress). When a pass consumed little it naps briefly so it stops
//! evicting producer cache lines. When every buffer was empty it waits on
//! the work condvar with a bounded timeout.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use io_uring::{opcode, types, IoUring};

use crate::config::{
    DIRECT_IO, LOW_WORK_THRESHOLD, POLL_INTERVAL_DURING_LOW_WORK_US, POLL_INTERVAL_NO_WORK_US,
    RELEASE_THRESHOLD, SECTOR_SIZE,
};
use crate::cycles;
use crate::encode::wire::WireEncoder;
use crate::encode::{Encoder, OutputBuffer};
use crate::runtime::coordinator::Runtime;
use crate::runtime::registry::SiteEntry;

/// The two output regions a worker run borrows from the coordinator and
/// hands back when it exits, so a log-file switch can relaunch without
/// reallocating.
pub(crate) struct WorkerBuffers {
    pub a: OutputBuffer,
    pub b: OutputBuffer,
}

struct InFlightWrite {
    buf: OutputBuffer,
    len: usize,
    started_at: u64,
}

/// At most one asynchronous write is ever in flight.
struct WorkerIo {
    ring: IoUring,
    fd: RawFd,
    write_offset: u64,
    in_flight: Option<InFlightWrite>,
}

impl WorkerIo {
    fn new(fd: RawFd, write_offset: u64) -> io::Result<WorkerIo> {
        Ok(WorkerIo {
            ring: IoUring::new(8)?,
            fd,
            write_offset,
            in_flight: None,
        })
    }

    fn has_outstanding(&self) -> bool {
        self.in_flight.is_some()
    }

    fn submit_write(
        &mut self,
        buf: OutputBuffer,
        len: usize,
        started_at: u64,
    ) -> Result<(), (io::Error, OutputBuffer)> {
        debug_assert!(self.in_flight.is_none());
        let op = opcode::Write::new(types::Fd(self.fd), buf.as_ptr(), len as u32)
            .offset(self.write_offset)
            .build()
            .user_data(0);
        if unsafe { self.ring.submission().push(&op) }.is_err() {
            let err = io::Error::new(io::ErrorKind::Other, "submission queue full");
            return Err((err, buf));
        }
        if let Err(e) = self.ring.submit() {
            return Err((e, buf));
        }
        self.write_offset += len as u64;
        self.in_flight = Some(InFlightWrite {
            buf,
            len,
            started_at,
        });
        Ok(())
    }

    /// Reaps the in-flight write if the kernel already finished it.
    fn poll_completion(&mut self) -> Option<(OutputBuffer, io::Result<usize>, u64)> {
        self.in_flight.as_ref()?;
        let cqe = self.ring.completion().next()?;
        self.finish(cqe.result())
    }

    /// Blocks until the in-flight write completes.
    fn wait_completion(&mut self) -> Option<(OutputBuffer, io::Result<usize>, u64)> {
        loop {
            self.in_flight.as_ref()?;
            if let Some(done) = self.poll_completion() {
                return Some(done);
            }
            if let Err(e) = self.ring.submit_and_wait(1) {
                let pending = self.in_flight.take()?;
                return Some((pending.buf, Err(e), pending.started_at));
            }
        }
    }

    fn finish(&mut self, raw: i32) -> Option<(OutputBuffer, io::Result<usize>, u64)> {
        let pending = self.in_flight.take()?;
        let outcome = if raw < 0 {
            Err(io::Error::from_raw_os_error(-raw))
        } else if (raw as usize) < pending.len {
            Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {raw} of {} bytes", pending.len),
            ))
        } else {
            Ok(raw as usize)
        };
        Some((pending.buf, outcome, pending.started_at))
    }
}

/// Zero bytes required to bring a direct-I/O write up to a sector multiple.
fn sector_padding(len: usize) -> usize {
    let over = len % SECTOR_SIZE;
    if over == 0 {
        0
    } else {
        SECTOR_SIZE - over
    }
}

fn note_completed(rt: &Runtime, result: io::Result<usize>, started_at: u64) {
    rt.metrics
        .cycles_disk_io_upper_bound
        .fetch_add(cycles::rdtsc().wrapping_sub(started_at), Ordering::Relaxed);
    if let Err(e) = result {
        eprintln!("blitzlog: asynchronous log write failed: {e}");
    }
    rt.metrics
        .num_aio_writes_completed
        .fetch_add(1, Ordering::Relaxed);
}

/// Thread body. Loops until the coordinator raises the exit flag, then
/// drains the outstanding write and returns the output buffers.
pub(crate) fn run(rt: &'static Runtime, bufs: WorkerBuffers) -> WorkerBuffers {
    let (fd, append_offset) = rt.output_write_target();
    let mut io = match WorkerIo::new(fd, append_offset) {
        Ok(io) => io,
        Err(e) => {
            eprintln!("blitzlog: could not set up the async I/O ring: {e}");
            std::process::exit(1);
        }
    };

    let mut encoder = WireEncoder::new(bufs.a);
    let mut spare = Some(bufs.b);

    // Round-robin cursor over the staging buffer list.
    let mut last_checked: usize = 0;
    // Latched when the encoder reports its output cannot take more.
    let mut output_full = false;
    // Set when the cursor crosses index zero; handed to the encoder so
    // decoders can reconstruct scan-pass epochs.
    let mut wrap_around = false;
    // Lock-free view of the registered call sites, extended only while
    // holding the registry mutex.
    let mut shadow: Vec<SiteEntry> = Vec::new();

    let mut awake_since = cycles::rdtsc();
    rt.cycle_at_thread_start.store(awake_since, Ordering::Relaxed);

    while !rt.control.should_exit.load(Ordering::Relaxed) {
        let mut consumed_this_pass: u64 = 0;

        {
            let mut buffers = rt.buffers.lock().unwrap();

            // Dictionary updates go out before any record can reference them.
            {
                let mut reg = rt.registry.lock().unwrap();
                let (next_persist, entries) = reg.dictionary_backlog();
                if *next_persist < entries.len() {
                    encoder.encode_new_dictionary_entries(next_persist, entries);
                }
                if shadow.len() < *next_persist {
                    shadow.extend_from_slice(&entries[shadow.len()..*next_persist]);
                }
            }

            if !buffers.list.is_empty() {
                if last_checked >= buffers.list.len() {
                    last_checked = 0;
                }
                let mut i = last_checked;
                loop {
                    if rt.control.should_exit.load(Ordering::Relaxed)
                        || output_full
                        || buffers.list.is_empty()
                    {
                        break;
                    }
                    let sb = Arc::clone(&buffers.list[i]);
                    let (base, available) = sb.peek();

                    if available > 0 {
                        // Long operation: release the list for producers
                        // registering new buffers.
                        drop(buffers);
                        rt.metrics.record_peek(available, sb.capacity());

                        let mut taken = 0usize;
                        while taken < available {
                            let chunk = (available - taken).min(RELEASE_THRESHOLD);
                            // Bytes in [taken, available) are committed and
                            // not yet consumed; the producer cannot touch
                            // them until consume() below releases them.
                            let src =
                                unsafe { core::slice::from_raw_parts(base.add(taken), chunk) };
                            let mut processed = 0u64;
                            let batch_start = cycles::rdtsc();
                            let read = encoder.encode_log_msgs(
                                src,
                                sb.id(),
                                wrap_around,
                                &shadow,
                                &mut processed,
                            );
                            rt.metrics
                                .record_compress_batch(cycles::rdtsc().wrapping_sub(batch_start));
                            rt.metrics
                                .logs_processed
                                .fetch_add(processed, Ordering::Relaxed);
                            if read == 0 {
                                last_checked = i;
                                output_full = true;
                                break;
                            }
                            wrap_around = false;
                            sb.consume(read);
                            taken += read;
                            consumed_this_pass += read as u64;
                            rt.metrics
                                .total_bytes_read
                                .fetch_add(read as u64, Ordering::Relaxed);
                        }

                        buffers = rt.buffers.lock().unwrap();
                    } else if sb.check_can_delete() {
                        // Owning thread is gone and the ring drained: dropping
                        // the list's Arc frees it.
                        buffers.list.remove(i);
                        if buffers.list.is_empty() {
                            last_checked = 0;
                            wrap_around = true;
                            break;
                        }
                        if last_checked >= i && last_checked > 0 {
                            last_checked -= 1;
                        }
                        // Step back so the advance below lands on the element
                        // that slid into this slot.
                        if i == 0 {
                            i = buffers.list.len() - 1;
                        } else {
                            i -= 1;
                        }
                    }

                    i = (i + 1) % buffers.list.len();
                    if i == 0 {
                        wrap_around = true;
                    }
                    if i == last_checked {
                        break;
                    }
                }
            }
            rt.metrics.num_scan_passes.fetch_add(1, Ordering::Relaxed);
        }

        if encoder.encoded_bytes() == 0 {
            // Nothing new was encoded. A full latch left over from a
            // dictionary stall must not suppress the next scan.
            output_full = false;

            if io.has_outstanding() {
                let sleep_start = cycles::rdtsc();
                rt.metrics
                    .cycles_active
                    .fetch_add(sleep_start.wrapping_sub(awake_since), Ordering::Relaxed);
                if let Some((buf, result, started_at)) = io.wait_completion() {
                    note_completed(rt, result, started_at);
                    spare = Some(buf);
                }
                awake_since = cycles::rdtsc();
                continue;
            }

            let mut ctl = rt.control.mu.lock().unwrap();
            if ctl.sync_requested {
                // One more pass captures anything committed before the
                // request raced with this scan.
                ctl.sync_requested = false;
                continue;
            }
            let now = cycles::rdtsc();
            rt.metrics
                .cycles_active
                .fetch_add(now.wrapping_sub(awake_since), Ordering::Relaxed);
            ctl.sync_epoch += 1;
            rt.control.hint_queue_emptied.notify_all();
            let (guard, _) = rt
                .control
                .work_added
                .wait_timeout(ctl, Duration::from_micros(POLL_INTERVAL_NO_WORK_US))
                .unwrap();
            drop(guard);
            awake_since = cycles::rdtsc();
            continue;
        }

        if io.has_outstanding() {
            let completion = match io.poll_completion() {
                Some(done) => Some(done),
                None if output_full => {
                    // Both output regions are unusable: block until the
                    // kernel hands one back.
                    let sleep_start = cycles::rdtsc();
                    rt.metrics
                        .cycles_active
                        .fetch_add(sleep_start.wrapping_sub(awake_since), Ordering::Relaxed);
                    let done = io.wait_completion();
                    awake_since = cycles::rdtsc();
                    done
                }
                None => {
                    if consumed_this_pass <= LOW_WORK_THRESHOLD
                        && POLL_INTERVAL_DURING_LOW_WORK_US > 0
                    {
                        let ctl = rt.control.mu.lock().unwrap();
                        let sleep_start = cycles::rdtsc();
                        rt.metrics
                            .cycles_active
                            .fetch_add(sleep_start.wrapping_sub(awake_since), Ordering::Relaxed);
                        let (guard, _) = rt
                            .control
                            .work_added
                            .wait_timeout(
                                ctl,
                                Duration::from_micros(POLL_INTERVAL_DURING_LOW_WORK_US),
                            )
                            .unwrap();
                        drop(guard);
                        awake_since = cycles::rdtsc();
                        rt.metrics
                            .num_low_work_sleeps
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    io.poll_completion()
                }
            };
            let Some((buf, result, started_at)) = completion else {
                continue;
            };
            note_completed(rt, result, started_at);
            spare = Some(buf);
        }

        // The spare region is free: swap it in and write out the full one.
        let encoded = encoder.encoded_bytes();
        let next = spare.take().expect("double buffer accounted for");
        let mut full = encoder.swap_buffer(next);

        let mut write_len = encoded;
        let mut pad = 0usize;
        if DIRECT_IO {
            pad = sector_padding(write_len);
            if pad > 0 {
                full.as_mut_slice()[write_len..write_len + pad].fill(0);
                write_len += pad;
            }
        }
        rt.metrics
            .record_write_issued(write_len as u64, pad as u64);

        if let Err((e, buf)) = io.submit_write(full, write_len, cycles::rdtsc()) {
            eprintln!("blitzlog: async write submission failed: {e}");
            spare = Some(buf);
        }
        output_full = false;
    }

    if let Some((buf, result, started_at)) = io.wait_completion() {
        note_completed(rt, result, started_at);
        spare = Some(buf);
    }
    rt.metrics
        .cycles_active
        .fetch_add(cycles::rdtsc().wrapping_sub(awake_since), Ordering::Relaxed);
    rt.cycle_at_thread_start.store(0, Ordering::Relaxed);

    let b = spare.take().expect("double buffer accounted for");
    WorkerBuffers {
        a: encoder.into_buffer(),
        b,
    }
}
