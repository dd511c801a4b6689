//! Lock-free SPSC ring queue for cache-coherent but high-latency shared
//! memory (fabric-attached or cross-NUMA windows).
//!
//! Fixed 64-byte entries move between two pinned threads or processes with
//! nothing but user-space loads and stores:
//! - the producer publishes each slot with one non-temporal 64-byte store,
//! - the consumer invalidates and re-loads the next expected slot,
//! - an epoch byte distinguishes fresh writes from previous-wrap leftovers,
//! - a whole-line XOR checksum rejects torn observations,
//! - the consumer writes its tail back at a 25%-capacity cadence so the
//!   producer rarely has to read shared memory to learn of freed slots.

pub mod backoff;
pub mod entry;
pub mod queue;

pub use backoff::{Backoff, MAX_WAIT_CYCLES};
pub use entry::{Entry, LINE_BYTES, PAYLOAD_BYTES, TailLine};
pub use queue::{Consumer, ConsumerMetrics, Producer, ProducerMetrics, channel};
