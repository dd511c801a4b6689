//! Bump-pointer cursor over a fixed memory window.

use crate::ArenaError;
use std::ptr::NonNull;

pub(crate) struct BumpCursor {
    base: usize,
    end: usize,
    cur: usize,
}

impl BumpCursor {
    pub(crate) fn new(base: NonNull<u8>, len: usize) -> Self {
        let base = base.as_ptr() as usize;
        Self {
            base,
            end: base + len,
            cur: base,
        }
    }

    /// Pad the cursor up to `align`, then advance it past `bytes`.
    pub(crate) fn alloc(&mut self, bytes: usize, align: usize) -> Result<NonNull<u8>, ArenaError> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");

        let aligned = (self.cur + align - 1) & !(align - 1);
        if aligned + bytes > self.end {
            return Err(ArenaError::Exhausted {
                requested: bytes,
                remaining: self.remaining(),
            });
        }

        self.cur = aligned + bytes;
        Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
    }

    pub(crate) fn used(&self) -> usize {
        self.cur - self.base
    }

    pub(crate) fn capacity(&self) -> usize {
        self.end - self.base
    }

    pub(crate) fn remaining(&self) -> usize {
        self.end - self.cur
    }
}
