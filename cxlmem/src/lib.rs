//! Shared-memory arenas and 64-byte line primitives for fabric-attached
//! buffers (CXL or cross-NUMA windows reachable by plain loads and stores).
//!
//! The memory is cache-coherent but high-latency: ordinary cached reads can
//! see stale lines and ordinary cached writes can dwell in the local cache
//! indefinitely. [`stream`] provides the streaming stores and invalidating
//! loads that make such memory usable; [`DaxArena`] and [`NumaArena`] carve
//! it out with bump-pointer discipline.

pub mod stream;

mod bump;
mod dax;
mod numa;

use std::io;
use std::ptr::NonNull;

pub use dax::{DEFAULT_DAX_LENGTH, DEFAULT_DAX_OFFSET, DEFAULT_DAX_PATH, DaxArena};
pub use numa::NumaArena;

/// Cache-line size of the shared fabric, in bytes.
pub const LINE_BYTES: usize = 64;

/// Run-time verbosity of the arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugLevel {
    Off,
    Low,
    High,
}

pub(crate) fn trace(level: DebugLevel, threshold: DebugLevel, msg: std::fmt::Arguments<'_>) {
    if level >= threshold {
        eprintln!("[cxlmem] {msg}");
    }
}

/// Error returned by arena construction and allocation.
#[derive(Debug)]
pub enum ArenaError {
    Io(io::Error),
    Exhausted { requested: usize, remaining: usize },
    UnalignedOffset { offset: u64, page_size: u64 },
    NodeOutOfRange(u32),
}

impl std::fmt::Display for ArenaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArenaError::Io(e) => write!(f, "io error: {e}"),
            ArenaError::Exhausted {
                requested,
                remaining,
            } => write!(
                f,
                "arena exhausted: requested {requested} bytes, {remaining} remaining"
            ),
            ArenaError::UnalignedOffset { offset, page_size } => write!(
                f,
                "offset {offset:#x} is not aligned to the {page_size}-byte page size"
            ),
            ArenaError::NodeOutOfRange(node) => write!(f, "NUMA node {node} out of range"),
        }
    }
}

impl std::error::Error for ArenaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArenaError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ArenaError {
    fn from(e: io::Error) -> Self {
        ArenaError::Io(e)
    }
}

/// Write a patterned line at `base` with ordinary stores, evict it, then
/// read it back. Returns true iff the round trip observed the pattern.
pub(crate) fn line_self_test(base: NonNull<u8>, seed: u8) -> bool {
    let p = base.as_ptr();
    unsafe {
        for i in 0..LINE_BYTES {
            p.add(i).write_volatile(seed.wrapping_add(i as u8));
        }
        stream::invalidate_line(p);
        for i in 0..LINE_BYTES {
            if p.add(i).read_volatile() != seed.wrapping_add(i as u8) {
                return false;
            }
        }
    }
    true
}

/// One of the two arena backings.
///
/// The queue side only ever needs `allocate_aligned` and `test_memory`, so a
/// plain sum over the backings is the whole polymorphic surface.
pub enum Arena {
    Dax(DaxArena),
    Numa(NumaArena),
}

impl Arena {
    /// Unaligned (byte-packed) allocation.
    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, ArenaError> {
        match self {
            Arena::Dax(a) => a.allocate(bytes),
            Arena::Numa(a) => a.allocate(bytes),
        }
    }

    pub fn allocate_aligned(
        &mut self,
        bytes: usize,
        align: usize,
    ) -> Result<NonNull<u8>, ArenaError> {
        match self {
            Arena::Dax(a) => a.allocate_aligned(bytes, align),
            Arena::Numa(a) => a.allocate_aligned(bytes, align),
        }
    }

    pub fn used(&self) -> usize {
        match self {
            Arena::Dax(a) => a.used(),
            Arena::Numa(a) => a.used(),
        }
    }

    pub fn remaining(&self) -> usize {
        match self {
            Arena::Dax(a) => a.remaining(),
            Arena::Numa(a) => a.remaining(),
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            Arena::Dax(a) => a.capacity(),
            Arena::Numa(a) => a.capacity(),
        }
    }

    /// Write-flush-read-back round trip on the first line of the mapping.
    pub fn test_memory(&mut self) -> bool {
        match self {
            Arena::Dax(a) => a.test_memory(),
            Arena::Numa(a) => a.test_memory(),
        }
    }

    pub fn set_debug(&mut self, level: DebugLevel) {
        match self {
            Arena::Dax(a) => a.set_debug(level),
            Arena::Numa(a) => a.set_debug(level),
        }
    }
}

impl From<DaxArena> for Arena {
    fn from(a: DaxArena) -> Self {
        Arena::Dax(a)
    }
}

impl From<NumaArena> for Arena {
    fn from(a: NumaArena) -> Self {
        Arena::Numa(a)
    }
}
