//! Single-process ping-pong echo benchmark over a shared-memory arena.
//!
//! A request ring and a response ring are carved from the same arena. The
//! server thread echoes every entry back; the client validates the echo and
//! measures round-trip latency.

use clap::{Parser, Subcommand};
use cxlmem::{
    Arena, ArenaError, DEFAULT_DAX_LENGTH, DEFAULT_DAX_OFFSET, DEFAULT_DAX_PATH, DaxArena,
    DebugLevel, NumaArena,
};
use cxlq::{Entry, channel};
use std::path::PathBuf;
use std::process;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "ping_pong")]
#[command(about = "Single producer/consumer echo loop over a shared-memory arena")]
struct Args {
    /// Logical CPU the client thread is pinned to (the server takes the
    /// next one)
    #[arg(long)]
    pin: usize,

    /// Ping-pong iterations
    #[arg(long, default_value_t = 1_000_000)]
    iters: u64,

    /// Ring order; capacity = 2^order entries
    #[arg(long, default_value_t = 14)]
    order: u32,

    #[command(subcommand)]
    memory: Memory,
}

#[derive(Subcommand)]
enum Memory {
    /// DRAM arena pinned to a NUMA node
    Numa {
        /// NUMA node to allocate from
        node: u32,
    },
    /// Window of a device-DAX character device
    Dax {
        #[arg(long, default_value = DEFAULT_DAX_PATH)]
        path: PathBuf,
        /// Byte offset of the window (page aligned)
        #[arg(long, default_value_t = DEFAULT_DAX_OFFSET)]
        offset: u64,
        /// Window length in bytes
        #[arg(long, default_value_t = DEFAULT_DAX_LENGTH)]
        length: usize,
    },
}

fn pin_to_core(core_id: usize) {
    core_affinity::set_for_current(core_affinity::CoreId { id: core_id });
}

fn open_arena(memory: &Memory) -> Result<Arena, ArenaError> {
    match memory {
        Memory::Numa { node } => {
            println!("allocator: NUMA node {node}");
            Ok(Arena::Numa(NumaArena::new(
                *node,
                DEFAULT_DAX_LENGTH,
                DebugLevel::Low,
            )?))
        }
        Memory::Dax {
            path,
            offset,
            length,
        } => {
            println!(
                "allocator: DAX window {} offset={offset:#x} length={length:#x}",
                path.display()
            );
            Ok(Arena::Dax(unsafe {
                DaxArena::open(path, *offset, *length, DebugLevel::Low)?
            }))
        }
    }
}

fn alloc_queue_lines(
    arena: &mut Arena,
    cap: usize,
) -> Result<(NonNull<Entry>, NonNull<u64>), ArenaError> {
    let ring = arena
        .allocate_aligned(cap * std::mem::size_of::<Entry>(), 64)?
        .cast::<Entry>();
    let tail = arena.allocate_aligned(64, 64)?.cast::<u64>();
    Ok((ring, tail))
}

fn main() {
    let args = Args::parse();

    let mut arena = match open_arena(&args.memory) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("arena init failed: {e}");
            process::exit(1);
        }
    };
    if !arena.test_memory() {
        eprintln!("arena self-test failed: write-flush-read-back mismatch");
        process::exit(1);
    }

    println!("client pinned to CPU {}", args.pin);
    println!("iterations          : {}", args.iters);

    let cap = 1usize << args.order;
    let (req_ring, req_tail) = match alloc_queue_lines(&mut arena, cap) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("allocation failed: {e}");
            process::exit(1);
        }
    };
    let (rsp_ring, rsp_tail) = match alloc_queue_lines(&mut arena, cap) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("allocation failed: {e}");
            process::exit(1);
        }
    };

    // Client produces requests and consumes responses; the server thread
    // owns the other two halves.
    let (mut req_tx, req_rx) = unsafe { channel(req_ring, args.order, req_tail) };
    let (rsp_tx, mut rsp_rx) = unsafe { channel(rsp_ring, args.order, rsp_tail) };

    let server_ready = Arc::new(AtomicBool::new(false));
    let ncpu = thread::available_parallelism().map(usize::from).unwrap_or(1);
    let server_cpu = (args.pin + 1) % ncpu;
    let iters = args.iters;

    let server = thread::spawn({
        let server_ready = Arc::clone(&server_ready);
        let mut req_rx = req_rx;
        let mut rsp_tx = rsp_tx;
        move || {
            pin_to_core(server_cpu);
            server_ready.store(true, Ordering::Release);

            let mut req = Entry::new();
            for i in 0..iters {
                while !req_rx.dequeue(&mut req) {}

                if req.rpc_id != i as u16 || req.payload[..8] != (i).to_le_bytes() {
                    eprintln!("[server] validation error on iteration {i}");
                    process::exit(1);
                }

                let mut rsp = req;
                while !rsp_tx.enqueue(&mut rsp) {}
            }
            (req_rx, rsp_tx)
        }
    });

    while !server_ready.load(Ordering::Acquire) {
        thread::yield_now();
    }
    pin_to_core(args.pin);

    let mut req = Entry::new();
    let mut rsp = Entry::new();
    let t0 = Instant::now();

    for i in 0..iters {
        req.payload[..8].copy_from_slice(&i.to_le_bytes());
        req.rpc_id = i as u16;
        req.rpc_method = 0;

        while !req_tx.enqueue(&mut req) {}
        while !rsp_rx.dequeue(&mut rsp) {}

        if rsp.rpc_id != req.rpc_id || rsp.payload[..8] != req.payload[..8] {
            eprintln!("[client] validation error on iteration {i}");
            process::exit(1);
        }
    }

    let elapsed = t0.elapsed();
    let (req_rx, rsp_tx) = server.join().expect("server thread panicked");

    let total_ns = elapsed.as_nanos() as f64;
    let rtt_ns = total_ns / iters as f64;
    println!();
    println!("total elapsed (ms)   : {:.2}", total_ns / 1e6);
    println!("round-trip latency/ns: {rtt_ns:.2}");
    println!("one-way latency/ns   : {:.2}", rtt_ns / 2.0);

    println!("\n[queue stats]");
    println!("-- request producer --\n{}", req_tx.metrics());
    println!("-- request consumer --\n{}", req_rx.metrics());
    println!("-- response producer --\n{}", rsp_tx.metrics());
    println!("-- response consumer --\n{}", rsp_rx.metrics());
}
