//! Per-thread staging ring for raw log records.
//!
//! Single producer, single consumer, variable-size records, wrap-around with
//! one byte of slack so `producer_pos == consumer_pos` always means empty.
//! The producer half lives in a thread-local handle; the shared half is
//! handed to the coordinator so the compression worker can drain it.

use core::cell::UnsafeCell;
use core::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[cfg(feature = "producer-stats")]
use core::sync::atomic::AtomicU32;

use crate::cycles;

#[cfg(feature = "producer-stats")]
use crate::config::BLOCKED_HIST_BUCKETS;

/// Cache-line aligned wrapper to prevent false sharing between the producer
/// and consumer cursors.
#[repr(align(64))]
pub(crate) struct CachePadded<T>(pub T);

impl<T> CachePadded<T> {
    pub const fn new(val: T) -> Self {
        Self(val)
    }
}

impl<T> core::ops::Deref for CachePadded<T> {
    type Target = T;
    #[inline(always)]
    fn deref(&self) -> &T {
        &self.0
    }
}

/// Shared half of a staging ring. Cursor fields are byte offsets into
/// `storage`; each is written by exactly one side.
pub struct StagingBuffer {
    storage: Box<[UnsafeCell<u8>]>,
    /// Next byte the producer will write. Published with Release by commit
    /// and by the wrap in the reserve slow path.
    producer_pos: CachePadded<AtomicUsize>,
    /// Next byte the consumer will read. Written only by the worker.
    consumer_pos: CachePadded<AtomicUsize>,
    /// Upper bound of committed bytes before the producer's last wrap.
    /// Bytes in [producer_pos, end_of_recorded) after a wrap are dead.
    end_of_recorded: AtomicUsize,
    /// Set by the producer handle's drop; the worker frees the buffer once
    /// this is set and the ring has drained empty.
    should_deallocate: AtomicBool,
    id: u32,

    // Producer statistics. Written by the owning thread, read racily by
    // get_histograms.
    pub(crate) num_allocations: AtomicU64,
    pub(crate) num_times_producer_blocked: AtomicU64,
    pub(crate) cycles_producer_blocked: AtomicU64,
    #[cfg(feature = "producer-stats")]
    pub(crate) blocked_dist: [AtomicU32; BLOCKED_HIST_BUCKETS],
}

// One thread writes each cursor, the UnsafeCell region is partitioned by the
// cursor protocol.
unsafe impl Send for StagingBuffer {}
unsafe impl Sync for StagingBuffer {}

impl StagingBuffer {
    /// Creates a ring and splits it: the producer handle goes to the owning
    /// thread, the `Arc` to the coordinator's buffer list.
    pub fn new(id: u32, capacity: usize) -> (StagingProducer, Arc<StagingBuffer>) {
        assert!(capacity >= 2, "staging ring needs at least two bytes");
        #[cfg(feature = "producer-stats")]
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO32: AtomicU32 = AtomicU32::new(0);

        let storage: Box<[UnsafeCell<u8>]> =
            (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
        let shared = Arc::new(StagingBuffer {
            storage,
            producer_pos: CachePadded::new(AtomicUsize::new(0)),
            consumer_pos: CachePadded::new(AtomicUsize::new(0)),
            end_of_recorded: AtomicUsize::new(capacity),
            should_deallocate: AtomicBool::new(false),
            id,
            num_allocations: AtomicU64::new(0),
            num_times_producer_blocked: AtomicU64::new(0),
            cycles_producer_blocked: AtomicU64::new(0),
            #[cfg(feature = "producer-stats")]
            blocked_dist: [ZERO32; BLOCKED_HIST_BUCKETS],
        });
        let producer = StagingProducer {
            buf: Arc::clone(&shared),
            min_free_space: capacity,
        };
        (producer, shared)
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Consumer side: returns the contiguous committed region as a raw
    /// pointer and length. The region stays valid until `consume` releases
    /// it back to the producer, so callers slice it incrementally rather
    /// than holding one reference across their own `consume` calls.
    ///
    /// At most one thread may act as the consumer of a given ring.
    pub fn peek(&self) -> (*const u8, usize) {
        let cached_producer = self.producer_pos.load(Ordering::Acquire);
        let mut consumer = self.consumer_pos.load(Ordering::Relaxed);

        if cached_producer < consumer {
            // The producer wrapped. Order the end_of_recorded read after the
            // producer_pos read.
            fence(Ordering::Acquire);
            let end = self.end_of_recorded.load(Ordering::Acquire);
            let available = end - consumer;
            if available > 0 {
                return (self.byte_ptr(consumer), available);
            }
            // Tail fully drained, roll over to the start.
            self.consumer_pos.store(0, Ordering::Release);
            consumer = 0;
        }

        (self.byte_ptr(consumer), cached_producer - consumer)
    }

    /// Releases `nbytes` back to the producer. Callers advance only past
    /// whole records.
    pub fn consume(&self, nbytes: usize) {
        let consumer = self.consumer_pos.load(Ordering::Relaxed);
        self.consumer_pos.store(consumer + nbytes, Ordering::Release);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.producer_pos.load(Ordering::Acquire) == self.consumer_pos.load(Ordering::Relaxed)
    }

    /// True once the owning thread is gone and every byte has been drained.
    pub fn check_can_delete(&self) -> bool {
        self.should_deallocate.load(Ordering::Acquire) && self.is_empty()
    }

    #[inline]
    fn byte_ptr(&self, offset: usize) -> *const u8 {
        debug_assert!(offset <= self.storage.len());
        unsafe { self.storage.as_ptr().add(offset) as *const u8 }
    }

    #[inline]
    fn byte_ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.storage.len());
        unsafe { self.storage.get_unchecked(offset).get() }
    }
}

impl StagingBuffer {
    #[cfg(test)]
    pub(crate) fn peek_slice(&self) -> &[u8] {
        let (ptr, len) = self.peek();
        unsafe { core::slice::from_raw_parts(ptr, len) }
    }
}

/// Producer half of a staging ring. Owned by exactly one thread.
pub struct StagingProducer {
    buf: Arc<StagingBuffer>,
    /// Cached lower bound on contiguous free bytes; purely a local
    /// optimization that avoids touching the consumer's cache line.
    min_free_space: usize,
}

impl StagingProducer {
    pub fn buffer(&self) -> &Arc<StagingBuffer> {
        &self.buf
    }

    /// Returns a writable region of at least `nbytes` contiguous bytes
    /// without publishing it, spinning if the ring is full. `nbytes` must be
    /// strictly less than the capacity or this never returns.
    #[inline]
    pub fn reserve(&mut self, nbytes: usize) -> &mut [u8] {
        if self.min_free_space <= nbytes {
            let ok = self.reserve_slow(nbytes, true);
            debug_assert!(ok);
        }
        self.producer_slice(nbytes)
    }

    /// Non-blocking variant: returns `None` when a single pass over the
    /// free-space state finds insufficient room.
    pub fn try_reserve(&mut self, nbytes: usize) -> Option<&mut [u8]> {
        if self.min_free_space <= nbytes && !self.reserve_slow(nbytes, false) {
            return None;
        }
        Some(self.producer_slice(nbytes))
    }

    /// Publishes `nbytes` previously written through `reserve`.
    #[inline]
    pub fn commit(&mut self, nbytes: usize) {
        debug_assert!(nbytes < self.min_free_space);
        let pos = self.buf.producer_pos.load(Ordering::Relaxed);
        self.buf.producer_pos.store(pos + nbytes, Ordering::Release);
        self.buf.num_allocations.fetch_add(1, Ordering::Relaxed);
        self.min_free_space -= nbytes;
    }

    /// Free-space refill. All comparisons are strict: letting the two
    /// cursors meet anywhere but empty would make full and empty
    /// indistinguishable.
    #[cold]
    fn reserve_slow(&mut self, nbytes: usize, blocking: bool) -> bool {
        let capacity = self.buf.capacity();
        let start = cycles::rdtsc();

        let mut fits = true;
        while self.min_free_space <= nbytes {
            let cached_consumer = self.buf.consumer_pos.load(Ordering::Acquire);
            let producer = self.buf.producer_pos.load(Ordering::Relaxed);

            if cached_consumer <= producer {
                self.min_free_space = capacity - producer;
                if self.min_free_space > nbytes {
                    break;
                }
                // Not enough room at the tail; wrap around.
                self.buf.end_of_recorded.store(producer, Ordering::Release);
                // Wrapping onto the consumer would read as empty, so hold
                // position until it moves off the start.
                if cached_consumer != 0 {
                    fence(Ordering::Release);
                    self.buf.producer_pos.store(0, Ordering::Release);
                    self.min_free_space = cached_consumer;
                }
            } else {
                self.min_free_space = cached_consumer - producer;
            }

            if !blocking && self.min_free_space <= nbytes {
                fits = false;
                break;
            }
            std::hint::spin_loop();
        }

        let blocked = cycles::rdtsc().wrapping_sub(start);
        self.buf
            .cycles_producer_blocked
            .fetch_add(blocked, Ordering::Relaxed);
        self.buf
            .num_times_producer_blocked
            .fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "producer-stats")]
        {
            let bucket =
                ((blocked / cycles::cycles_in_10ns()) as usize).min(BLOCKED_HIST_BUCKETS - 1);
            self.buf.blocked_dist[bucket].fetch_add(1, Ordering::Relaxed);
        }
        fits
    }

    #[inline]
    fn producer_slice(&mut self, nbytes: usize) -> &mut [u8] {
        let pos = self.buf.producer_pos.load(Ordering::Relaxed);
        debug_assert!(pos + nbytes <= self.buf.capacity());
        if nbytes == 0 {
            return &mut [];
        }
        unsafe { core::slice::from_raw_parts_mut(self.buf.byte_ptr_at(pos), nbytes) }
    }
}

impl Drop for StagingProducer {
    fn drop(&mut self) {
        // The worker frees the ring once it drains empty.
        self.buf.should_deallocate.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(slot: &mut [u8], seed: u8) {
        for (i, b) in slot.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
    }

    #[test]
    fn test_basic_produce_consume() {
        let (mut producer, buf) = StagingBuffer::new(0, 64);
        assert!(buf.is_empty());

        let slot = producer.reserve(8);
        fill(slot, 1);
        producer.commit(8);

        let peeked = buf.peek_slice();
        assert_eq!(peeked.len(), 8);
        assert_eq!(peeked[0], 1);
        assert_eq!(peeked[7], 8);

        buf.consume(8);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_capacity_minus_one_fits_full_blocks() {
        let (mut producer, buf) = StagingBuffer::new(0, 64);

        // One byte of slack is reserved to keep empty and full distinct.
        assert!(producer.try_reserve(64).is_none());
        let slot = producer.try_reserve(63).expect("capacity - 1 must fit");
        fill(slot, 0);
        producer.commit(63);

        let (_, len) = buf.peek();
        assert_eq!(len, 63);
        assert_eq!(buf.num_times_producer_blocked.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_wrap_preserves_order() {
        let (mut producer, buf) = StagingBuffer::new(0, 32);

        fill(producer.reserve(20), 100);
        producer.commit(20);
        buf.peek();
        buf.consume(20);

        // Tail has 12 bytes free, so a 16-byte record forces a wrap.
        fill(producer.reserve(16), 7);
        producer.commit(16);

        // First peek drains the dead tail bookkeeping and lands at start.
        let peeked = buf.peek_slice();
        assert_eq!(peeked.len(), 16);
        assert_eq!(peeked[0], 7);
        buf.consume(16);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_no_wrap_onto_consumer_at_start() {
        let (mut producer, buf) = StagingBuffer::new(0, 32);

        fill(producer.reserve(24), 0);
        producer.commit(24);
        // Consumer has not moved: wrapping would land on offset 0.
        assert!(producer.try_reserve(10).is_none());

        buf.peek();
        buf.consume(8);
        // Consumer still parks the start of the ring hostage until it rolls.
        assert!(producer.try_reserve(10).is_none());

        buf.consume(16);
        buf.peek(); // rolls consumer off the tail
        assert!(producer.try_reserve(10).is_some());
    }

    #[test]
    fn test_peek_after_wrap_returns_tail_then_head() {
        let (mut producer, buf) = StagingBuffer::new(0, 32);

        fill(producer.reserve(24), 1);
        producer.commit(24);
        buf.peek();
        buf.consume(12); // consumer at 12, 12 committed bytes left in tail

        fill(producer.reserve(10), 2); // wraps, head now holds 10 bytes
        producer.commit(10);

        let first = buf.peek_slice();
        assert_eq!(first.len(), 12);
        assert_eq!(first[0], 1u8.wrapping_add(12));
        buf.consume(12);

        let second = buf.peek_slice();
        assert_eq!(second.len(), 10);
        assert_eq!(second[0], 2);
        buf.consume(10);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_deferred_deallocation() {
        let (mut producer, buf) = StagingBuffer::new(3, 64);
        fill(producer.reserve(4), 9);
        producer.commit(4);
        drop(producer);

        // Flagged but not yet drained.
        assert!(!buf.check_can_delete());
        buf.peek();
        buf.consume(4);
        assert!(buf.check_can_delete());
    }

    #[test]
    fn test_blocking_reserve_returns_after_consumer_advances() {
        let (mut producer, buf) = StagingBuffer::new(0, 64);
        fill(producer.reserve(60), 0);
        producer.commit(60);

        let consumer = std::thread::spawn({
            let buf = Arc::clone(&buf);
            move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                let (_, len) = buf.peek();
                buf.consume(len);
            }
        });

        // Spins until the consumer frees the head of the ring.
        let slot = producer.reserve(16);
        fill(slot, 1);
        producer.commit(16);
        consumer.join().expect("consumer thread panicked");
        assert!(buf.num_times_producer_blocked.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_cross_thread_fifo() {
        let (mut producer, buf) = StagingBuffer::new(0, 256);
        let total: u64 = 50_000;

        let consumer = std::thread::spawn({
            let buf = Arc::clone(&buf);
            move || {
                let mut expected: u64 = 0;
                let mut seen: u64 = 0;
                while seen < total {
                    let (ptr, len) = buf.peek();
                    if len == 0 {
                        std::hint::spin_loop();
                        continue;
                    }
                    let bytes = unsafe { core::slice::from_raw_parts(ptr, len) };
                    for &b in bytes {
                        assert_eq!(b, expected as u8, "byte {seen} out of order");
                        expected = expected.wrapping_add(1);
                        seen += 1;
                    }
                    buf.consume(len);
                }
            }
        });

        let mut next: u64 = 0;
        while next < total {
            let n = ((next % 13) + 1) as usize;
            let n = n.min((total - next) as usize);
            let slot = producer.reserve(n);
            for b in slot.iter_mut() {
                *b = next as u8;
                next += 1;
            }
            producer.commit(n);
        }

        consumer.join().expect("consumer thread panicked");
        assert!(buf.is_empty());
    }
}
