//! The SPSC queue over a shared ring and a shared tail line.
//!
//! The ring is written only by the producer and read only by the consumer;
//! the tail line is written only by the consumer and read only by the
//! producer. There are no locks and no compare-and-swap on shared memory:
//! the epoch/checksum pair on each slot carries the "slot ready" signal,
//! and the producer's shadow tail keeps cross-memory tail reads off the
//! enqueue fast path.

use crate::backoff::{
    Backoff, CONSUMER_EMPTY_MIN_WAIT, CONSUMER_TORN_MIN_WAIT, PRODUCER_FULL_MIN_WAIT,
};
use crate::entry::Entry;
use cxlmem::stream;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

pub const MIN_ORDER: u32 = 1;
pub const MAX_ORDER: u32 = 24;

fn check_geometry(ring: NonNull<Entry>, order: u32, shared_tail: NonNull<u64>) {
    assert!(
        (MIN_ORDER..=MAX_ORDER).contains(&order),
        "ring order {order} out of range"
    );
    assert_eq!(
        ring.as_ptr() as usize & 63,
        0,
        "ring is not 64-byte aligned"
    );
    assert_eq!(
        shared_tail.as_ptr() as usize & 63,
        0,
        "shared tail is not 64-byte aligned"
    );
}

/// Producer-side monotonic counters. Written only by the producer role.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProducerMetrics {
    pub enqueue_calls: u64,
    pub shared_tail_reads: u64,
    pub queue_full_events: u64,
    pub producer_backoff_events: u64,
    pub producer_backoff_cycles: u64,
}

impl fmt::Display for ProducerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "enqueue calls         : {}", self.enqueue_calls)?;
        writeln!(f, "shared-tail reads     : {}", self.shared_tail_reads)?;
        writeln!(f, "queue-full events     : {}", self.queue_full_events)?;
        writeln!(f, "backoff events        : {}", self.producer_backoff_events)?;
        write!(f, "backoff cycles waited : {}", self.producer_backoff_cycles)
    }
}

/// Consumer-side monotonic counters. Written only by the consumer role.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsumerMetrics {
    pub dequeue_calls: u64,
    pub no_new_item_polls: u64,
    pub checksum_failures: u64,
    pub tail_flushes: u64,
    pub consumer_backoff_events: u64,
    pub consumer_backoff_cycles: u64,
}

impl fmt::Display for ConsumerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "dequeue calls         : {}", self.dequeue_calls)?;
        writeln!(f, "no-new-item polls     : {}", self.no_new_item_polls)?;
        writeln!(f, "checksum failures     : {}", self.checksum_failures)?;
        writeln!(f, "tail flushes          : {}", self.tail_flushes)?;
        writeln!(f, "backoff events        : {}", self.consumer_backoff_events)?;
        write!(f, "backoff cycles waited : {}", self.consumer_backoff_cycles)
    }
}

/// Producer half of the queue.
///
/// Exactly one thread may drive a `Producer`. Extending to several
/// producers requires promoting the head store to an atomic exchange and
/// serialising the shared-tail refresh behind an external mutex; neither is
/// provided here.
pub struct Producer {
    ring: *mut Entry,
    shared_tail: *const u64,
    order: u32,
    mask: u32,
    head: AtomicU32,
    shadow_tail: u32,
    backoff_full: Backoff,
    metrics: ProducerMetrics,
}

unsafe impl Send for Producer {}

impl Producer {
    /// # Safety
    ///
    /// - `ring` must point to `2^order` entries, 64-byte aligned, writable,
    ///   in memory shared with the consumer
    /// - `shared_tail` must point to a dedicated 64-byte line in the same
    ///   region
    /// - no other producer may operate on the same ring
    pub unsafe fn new(
        ring: NonNull<Entry>,
        order: u32,
        shared_tail: NonNull<u64>,
        initialize: bool,
    ) -> Self {
        check_geometry(ring, order, shared_tail);

        if initialize {
            unsafe {
                std::ptr::write_bytes(ring.as_ptr(), 0, 1usize << order);
                stream::publish_u64(shared_tail.as_ptr(), 0);
            }
        }

        Self {
            ring: ring.as_ptr(),
            shared_tail: shared_tail.as_ptr(),
            order,
            mask: (1u32 << order) - 1,
            head: AtomicU32::new(0),
            shadow_tail: 0,
            backoff_full: Backoff::new(PRODUCER_FULL_MIN_WAIT),
            metrics: ProducerMetrics::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    pub fn metrics(&self) -> ProducerMetrics {
        self.metrics
    }

    /// Stamp `entry` with the slot epoch and checksum, then publish it.
    ///
    /// Returns false without retrying when the ring is still full after one
    /// shared-tail refresh; the backoff grows until an enqueue succeeds.
    pub fn enqueue(&mut self, entry: &mut Entry) -> bool {
        self.metrics.enqueue_calls += 1;

        let head = self.head.load(Ordering::Relaxed);
        let cap = self.mask + 1;

        if head.wrapping_sub(self.shadow_tail) >= cap {
            self.metrics.shared_tail_reads += 1;
            self.shadow_tail = unsafe { stream::observe_u64(self.shared_tail) } as u32;

            if head.wrapping_sub(self.shadow_tail) >= cap {
                self.metrics.queue_full_events += 1;
                let waited = self.backoff_full.pause();
                self.metrics.producer_backoff_events += 1;
                self.metrics.producer_backoff_cycles += u64::from(waited);
                return false;
            }
        }
        self.backoff_full.reset();

        entry.epoch = (head >> self.order).wrapping_add(1) as u8;
        entry.seal();

        unsafe {
            let slot = self.ring.add((head & self.mask) as usize);
            stream::publish_line(slot.cast(), (entry as *const Entry).cast());
        }

        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }
}

/// Consumer half of the queue.
///
/// Exactly one thread may drive a `Consumer`. The tail is written back to
/// the shared line every capacity/4 dequeues, trading producer wake-up
/// latency for far fewer cross-memory tail reads.
pub struct Consumer {
    ring: *const Entry,
    shared_tail: *mut u64,
    order: u32,
    mask: u32,
    tail: u32,
    flush_mask: u32,
    backoff_empty: Backoff,
    backoff_torn: Backoff,
    metrics: ConsumerMetrics,
}

unsafe impl Send for Consumer {}

impl Consumer {
    /// # Safety
    ///
    /// - `ring` must point to `2^order` entries, 64-byte aligned, in memory
    ///   shared with the producer
    /// - `shared_tail` must point to a dedicated 64-byte line in the same
    ///   region, writable by this process
    /// - no other consumer may operate on the same ring
    pub unsafe fn new(
        ring: NonNull<Entry>,
        order: u32,
        shared_tail: NonNull<u64>,
        initialize: bool,
    ) -> Self {
        check_geometry(ring, order, shared_tail);

        if initialize {
            unsafe {
                std::ptr::write_bytes(ring.as_ptr(), 0, 1usize << order);
                stream::publish_u64(shared_tail.as_ptr(), 0);
            }
        }

        let cap = 1u32 << order;
        let flush_interval = (cap / 4).max(1);

        Self {
            ring: ring.as_ptr(),
            shared_tail: shared_tail.as_ptr(),
            order,
            mask: cap - 1,
            tail: 0,
            flush_mask: flush_interval - 1,
            backoff_empty: Backoff::new(CONSUMER_EMPTY_MIN_WAIT),
            backoff_torn: Backoff::new(CONSUMER_TORN_MIN_WAIT),
            metrics: ConsumerMetrics::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask as usize + 1
    }

    pub fn metrics(&self) -> ConsumerMetrics {
        self.metrics
    }

    /// Observe the next expected slot into `out`; on a fresh epoch and a
    /// clean checksum, advance the tail.
    ///
    /// An epoch mismatch means nothing new was published. A checksum
    /// mismatch means the producer's write is still in flight; the tail is
    /// not advanced and the slot will be observed intact on a later call.
    pub fn dequeue(&mut self, out: &mut Entry) -> bool {
        self.metrics.dequeue_calls += 1;

        let tail = self.tail;
        unsafe {
            let slot = self.ring.add((tail & self.mask) as usize);
            stream::observe_line((out as *mut Entry).cast(), slot.cast());
        }

        let expected_epoch = (tail >> self.order).wrapping_add(1) as u8;
        if out.epoch != expected_epoch {
            self.metrics.no_new_item_polls += 1;
            let waited = self.backoff_empty.pause();
            self.metrics.consumer_backoff_events += 1;
            self.metrics.consumer_backoff_cycles += u64::from(waited);
            return false;
        }

        if !out.verify() {
            self.metrics.checksum_failures += 1;
            let waited = self.backoff_torn.pause();
            self.metrics.consumer_backoff_events += 1;
            self.metrics.consumer_backoff_cycles += u64::from(waited);
            return false;
        }

        self.tail = tail.wrapping_add(1);
        self.backoff_empty.reset();
        self.backoff_torn.reset();

        if self.tail & self.flush_mask == 0 {
            unsafe { stream::publish_u64(self.shared_tail, u64::from(self.tail)) };
            self.metrics.tail_flushes += 1;
        }

        true
    }
}

/// Build both halves over the same memory, with the producer owning
/// initialisation. For two-process setups construct each half directly and
/// pass `initialize` on exactly one side.
///
/// # Safety
///
/// Same contract as [`Producer::new`] and [`Consumer::new`] combined.
pub unsafe fn channel(
    ring: NonNull<Entry>,
    order: u32,
    shared_tail: NonNull<u64>,
) -> (Producer, Consumer) {
    let producer = unsafe { Producer::new(ring, order, shared_tail, true) };
    let consumer = unsafe { Consumer::new(ring, order, shared_tail, false) };
    (producer, consumer)
}
