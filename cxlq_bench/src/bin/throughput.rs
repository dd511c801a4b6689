//! Two-process throughput benchmark over a device-DAX window.
//!
//! Run the producer on one host (or socket) and the consumer on the other.
//! Both processes map the same window and carve the same lines from it in
//! the same fixed order: ring, shared tail, producer-ready, consumer-ready,
//! start-signal. The flag lines then carry the bootstrap handshake.

use clap::{Parser, ValueEnum};
use cxlmem::{
    ArenaError, DEFAULT_DAX_LENGTH, DEFAULT_DAX_OFFSET, DEFAULT_DAX_PATH, DaxArena, DebugLevel,
    stream,
};
use cxlq::{Consumer, Entry, Producer};
use std::path::PathBuf;
use std::process;
use std::ptr::NonNull;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Producer,
    Consumer,
}

#[derive(Parser)]
#[command(name = "throughput")]
#[command(about = "Two-process SPSC benchmark over a shared device-DAX window")]
struct Args {
    /// Role of this process
    #[arg(value_enum)]
    role: Role,

    /// Logical CPU to pin the main thread to
    #[arg(long)]
    pin: usize,

    /// Iterations (including warm-up)
    #[arg(long, default_value_t = 10_000_000)]
    iters: u64,

    /// Ring order; capacity = 2^order entries
    #[arg(long, default_value_t = 14)]
    order: u32,

    /// DAX device path
    #[arg(long, default_value = DEFAULT_DAX_PATH)]
    path: PathBuf,

    /// Byte offset of the window (page aligned)
    #[arg(long, default_value_t = DEFAULT_DAX_OFFSET)]
    offset: u64,

    /// Window length in bytes
    #[arg(long, default_value_t = DEFAULT_DAX_LENGTH)]
    length: usize,
}

struct SharedLines {
    ring: NonNull<Entry>,
    tail: NonNull<u64>,
    producer_ready: NonNull<u64>,
    consumer_ready: NonNull<u64>,
    start_signal: NonNull<u64>,
}

fn pin_to_core(core_id: usize) {
    core_affinity::set_for_current(core_affinity::CoreId { id: core_id });
}

/// Both processes must call this with the same capacity so the lines land
/// at the same offsets.
fn carve_shared_lines(arena: &mut DaxArena, cap: usize) -> Result<SharedLines, ArenaError> {
    let ring = arena
        .allocate_aligned(cap * std::mem::size_of::<Entry>(), 64)?
        .cast::<Entry>();
    let tail = arena.allocate_aligned(64, 64)?.cast::<u64>();
    let producer_ready = arena.allocate_aligned(64, 64)?.cast::<u64>();
    let consumer_ready = arena.allocate_aligned(64, 64)?.cast::<u64>();
    let start_signal = arena.allocate_aligned(64, 64)?.cast::<u64>();
    Ok(SharedLines {
        ring,
        tail,
        producer_ready,
        consumer_ready,
        start_signal,
    })
}

fn wait_for(flag: NonNull<u64>) {
    while unsafe { stream::observe_u64(flag.as_ptr()) } == 0 {
        stream::pause_cycles(100);
    }
}

fn run_producer(args: &Args, lines: &SharedLines) {
    unsafe {
        stream::publish_u64(lines.producer_ready.as_ptr(), 0);
        stream::publish_u64(lines.consumer_ready.as_ptr(), 0);
        stream::publish_u64(lines.start_signal.as_ptr(), 0);
    }

    let mut tx = unsafe { Producer::new(lines.ring, args.order, lines.tail, true) };

    println!("[producer] warming up...");
    let warmup = (tx.capacity() / 4) as u64;
    assert!(
        warmup < args.iters,
        "warm-up must be smaller than total iterations"
    );

    let mut e = Entry::new();
    e.rpc_method = 1;
    e.seal_index = -1;
    for i in 0..warmup {
        e.rpc_id = i as u16;
        while !tx.enqueue(&mut e) {}
    }

    println!("[producer] warm-up complete, signalling readiness");
    unsafe { stream::publish_u64(lines.producer_ready.as_ptr(), 1) };

    println!("[producer] waiting for consumer...");
    wait_for(lines.consumer_ready);

    println!("[producer] consumer ready, starting benchmark");
    unsafe { stream::publish_u64(lines.start_signal.as_ptr(), 1) };

    let t0 = Instant::now();
    for i in warmup..args.iters {
        e.rpc_id = i as u16;
        while !tx.enqueue(&mut e) {}
    }
    let elapsed = t0.elapsed();

    let produced = args.iters - warmup;
    println!(
        "\n[producer] producer time: {:.2} ns/op",
        elapsed.as_nanos() as f64 / produced as f64
    );
    println!("-- producer metrics --\n{}", tx.metrics());
}

fn run_consumer(args: &Args, lines: &SharedLines) {
    println!("[consumer] waiting for producer to be ready...");
    wait_for(lines.producer_ready);

    let mut rx = unsafe { Consumer::new(lines.ring, args.order, lines.tail, false) };

    println!("[consumer] producer ready, signalling own readiness");
    unsafe { stream::publish_u64(lines.consumer_ready.as_ptr(), 1) };

    println!("[consumer] waiting for start signal...");
    wait_for(lines.start_signal);

    println!("[consumer] start signal received, consuming");

    let mut e = Entry::new();
    let mut consumed = 0u64;
    let t0 = Instant::now();
    while consumed < args.iters {
        if rx.dequeue(&mut e) {
            if e.rpc_id != consumed as u16 {
                eprintln!(
                    "[consumer] sequence mismatch: expected rpc_id {}, got {}",
                    consumed as u16, e.rpc_id
                );
                process::exit(1);
            }
            consumed += 1;
        }
    }
    let elapsed = t0.elapsed();

    println!(
        "\n[consumer] consumer time: {:.2} ns/op",
        elapsed.as_nanos() as f64 / args.iters as f64
    );
    println!("-- consumer metrics --\n{}", rx.metrics());
}

fn main() {
    let args = Args::parse();
    pin_to_core(args.pin);

    let role = match args.role {
        Role::Producer => "producer",
        Role::Consumer => "consumer",
    };

    let mut arena =
        match unsafe { DaxArena::open(&args.path, args.offset, args.length, DebugLevel::Low) } {
            Ok(a) => a,
            Err(e) => {
                eprintln!("[{role}] arena init failed: {e}");
                process::exit(1);
            }
        };
    if !arena.test_memory() {
        eprintln!("[{role}] arena self-test failed: write-flush-read-back mismatch");
        process::exit(1);
    }

    println!("[{role}] pinned to CPU {}", args.pin);
    println!("[{role}] iterations      : {}", args.iters);

    let cap = 1usize << args.order;
    let lines = match carve_shared_lines(&mut arena, cap) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("[{role}] allocation failed: {e}");
            process::exit(1);
        }
    };

    match args.role {
        Role::Producer => run_producer(&args, &lines),
        Role::Consumer => run_consumer(&args, &lines),
    }
}
