//! End-to-end SPSC tests over heap-backed rings: FIFO order, full/empty
//! rejection, wrap reuse, tail-flush cadence, torn-slot rejection, and two
//! threaded runs.

use cxlq::{Consumer, Entry, Producer, TailLine, channel};
use std::ptr::NonNull;
use std::thread;
use std::time::Duration;

struct RingMem {
    ring: Vec<Entry>,
    tail: Box<TailLine>,
}

impl RingMem {
    fn new(order: u32) -> Self {
        Self {
            ring: vec![Entry::new(); 1usize << order],
            tail: Box::new(TailLine::new()),
        }
    }

    fn split(&mut self, order: u32) -> (Producer, Consumer) {
        unsafe {
            channel(
                NonNull::new(self.ring.as_mut_ptr()).unwrap(),
                order,
                NonNull::new(self.tail.counter()).unwrap(),
            )
        }
    }
}

fn entry_with_id(id: u16) -> Entry {
    let mut e = Entry::new();
    e.rpc_id = id;
    e
}

#[test]
fn fifo_order_on_small_ring() {
    let mut mem = RingMem::new(4);
    let (mut tx, mut rx) = mem.split(4);

    for i in 0..15u16 {
        let mut e = entry_with_id(i);
        assert!(tx.enqueue(&mut e));
    }

    let mut out = Entry::new();
    for i in 0..15u16 {
        assert!(rx.dequeue(&mut out));
        assert_eq!(out.rpc_id, i);
    }
    assert!(!rx.dequeue(&mut out));
}

#[test]
fn full_rejection_then_refill() {
    let mut mem = RingMem::new(4);
    let (mut tx, mut rx) = mem.split(4);

    for i in 0..16u16 {
        let mut e = entry_with_id(i);
        assert!(tx.enqueue(&mut e));
    }

    // 17th entry: one shared-tail refresh, still full, rejected.
    let mut extra = entry_with_id(16);
    assert!(!tx.enqueue(&mut extra));
    assert_eq!(tx.metrics().shared_tail_reads, 1);
    assert_eq!(tx.metrics().queue_full_events, 1);
    assert_eq!(tx.metrics().producer_backoff_events, 1);

    let mut out = Entry::new();
    for i in 0..8u16 {
        assert!(rx.dequeue(&mut out));
        assert_eq!(out.rpc_id, i);
    }

    // The drain published tail = 8, so half the ring is free again.
    for i in 16..24u16 {
        let mut e = entry_with_id(i);
        assert!(tx.enqueue(&mut e), "enqueue of id {i} failed");
    }

    for i in 8..24u16 {
        assert!(rx.dequeue(&mut out));
        assert_eq!(out.rpc_id, i);
    }
    assert!(!rx.dequeue(&mut out));
}

#[test]
fn empty_on_fresh_queue() {
    let mut mem = RingMem::new(4);
    let (_tx, mut rx) = mem.split(4);

    let mut out = Entry::new();
    assert!(!rx.dequeue(&mut out));
    assert_eq!(rx.metrics().no_new_item_polls, 1);
}

#[test]
fn empty_after_balanced_traffic() {
    let mut mem = RingMem::new(4);
    let (mut tx, mut rx) = mem.split(4);

    let mut out = Entry::new();
    for i in 0..5u16 {
        let mut e = entry_with_id(i);
        assert!(tx.enqueue(&mut e));
        assert!(rx.dequeue(&mut out));
    }
    assert!(!rx.dequeue(&mut out));
}

#[test]
fn reuse_across_wraps() {
    let order = 4;
    let mut mem = RingMem::new(order);
    let (mut tx, mut rx) = mem.split(order);

    let rounds = 4 * (1u32 << order);
    let mut out = Entry::new();
    for i in 0..rounds {
        let mut e = entry_with_id(i as u16);
        assert!(tx.enqueue(&mut e));
        assert!(rx.dequeue(&mut out));
        assert_eq!(out.rpc_id, i as u16);
        assert_eq!(out.epoch, ((i >> order) + 1) as u8);
    }

    // The ring is still fully usable after the wraps.
    for i in 0..16u16 {
        let mut e = entry_with_id(i);
        assert!(tx.enqueue(&mut e));
    }
    let mut extra = entry_with_id(99);
    assert!(!tx.enqueue(&mut extra));
}

#[test]
fn tail_flush_cadence() {
    let order = 4; // capacity 16, flush interval 4
    let mut mem = RingMem::new(order);
    let (mut tx, mut rx) = mem.split(order);

    let mut out = Entry::new();
    for i in 0..32u16 {
        let mut e = entry_with_id(i);
        assert!(tx.enqueue(&mut e));
        assert!(rx.dequeue(&mut out));
    }
    assert_eq!(rx.metrics().tail_flushes, 32 / 4);
}

#[test]
fn tail_flush_interval_floors_at_one() {
    let order = 1; // capacity 2, flush interval max(1, 0) = 1
    let mut mem = RingMem::new(order);
    let (mut tx, mut rx) = mem.split(order);

    let mut out = Entry::new();
    for i in 0..5u16 {
        let mut e = entry_with_id(i);
        assert!(tx.enqueue(&mut e));
        assert!(rx.dequeue(&mut out));
    }
    assert_eq!(rx.metrics().tail_flushes, 5);
}

#[test]
fn corrupted_slot_is_rejected_without_advancing() {
    let mut mem = RingMem::new(4);
    let (mut tx, mut rx) = mem.split(4);

    let mut first = entry_with_id(1);
    let mut second = entry_with_id(2);
    assert!(tx.enqueue(&mut first));
    assert!(tx.enqueue(&mut second));

    // Flip one payload bit of the second slot directly in the ring.
    unsafe {
        let slot = mem.ring.as_mut_ptr().add(1);
        (*slot).payload[0] ^= 1;
    }

    let mut out = Entry::new();
    assert!(rx.dequeue(&mut out));
    assert_eq!(out.rpc_id, 1);

    assert!(!rx.dequeue(&mut out));
    assert_eq!(rx.metrics().checksum_failures, 1);
    assert!(!rx.dequeue(&mut out));
    assert_eq!(rx.metrics().checksum_failures, 2);

    // Restore the bit: the very same slot dequeues cleanly, so the tail
    // never moved past it.
    unsafe {
        let slot = mem.ring.as_mut_ptr().add(1);
        (*slot).payload[0] ^= 1;
    }
    assert!(rx.dequeue(&mut out));
    assert_eq!(out.rpc_id, 2);
}

#[test]
fn threaded_spsc_50k() {
    const ITERS: u32 = 50_000;
    let order = 4;
    let mut mem = RingMem::new(order);
    let (mut tx, mut rx) = mem.split(order);

    let producer = thread::spawn(move || {
        let mut e = Entry::new();
        for i in 0..ITERS {
            e.rpc_id = i as u16;
            e.payload[..4].copy_from_slice(&i.to_le_bytes());
            while !tx.enqueue(&mut e) {}
        }
    });

    let consumer = thread::spawn(move || {
        let mut out = Entry::new();
        let mut seen = 0u32;
        while seen < ITERS {
            if rx.dequeue(&mut out) {
                assert_eq!(out.rpc_id, seen as u16, "sequence break at {seen}");
                assert_eq!(out.payload[..4], seen.to_le_bytes());
                seen += 1;
            }
        }
        seen
    });

    producer.join().unwrap();
    let seen = consumer.join().unwrap();
    assert_eq!(seen, ITERS);
}

#[test]
fn interleaved_with_sleeps() {
    const ITERS: u32 = 10_000;
    let order = 4;
    let mut mem = RingMem::new(order);
    let (mut tx, mut rx) = mem.split(order);

    let producer = thread::spawn(move || {
        let mut e = Entry::new();
        for i in 0..ITERS {
            e.rpc_id = i as u16;
            e.payload[..4].copy_from_slice(&i.to_le_bytes());
            while !tx.enqueue(&mut e) {}
            if i % 256 == 0 {
                thread::sleep(Duration::from_micros(50));
            }
        }
        tx
    });

    let consumer = thread::spawn(move || {
        let mut out = Entry::new();
        let mut seen = 0u32;
        while seen < ITERS {
            if rx.dequeue(&mut out) {
                assert_eq!(out.rpc_id, seen as u16, "sequence break at {seen}");
                seen += 1;
                if seen % 128 == 0 {
                    thread::sleep(Duration::from_micros(200));
                }
            }
        }
        rx
    });

    let tx = producer.join().unwrap();
    let rx = consumer.join().unwrap();

    // The consumer's sleeps are long enough for the small ring to fill, and
    // the producer's sleeps leave the consumer polling an empty ring.
    assert!(tx.metrics().queue_full_events >= 1);
    assert!(tx.metrics().producer_backoff_cycles > 0);
    assert!(rx.metrics().no_new_item_polls >= 1);
    assert!(rx.metrics().consumer_backoff_events >= 1);
}
