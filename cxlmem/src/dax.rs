//! Device-DAX arena: a window of a /dev/dax character device mapped with
//! synchronous page faults. The backing device provides cache-coherent
//! shared memory between independent processes, or between hosts that
//! expose the same device over a memory fabric.

use crate::bump::BumpCursor;
use crate::{ArenaError, DebugLevel, line_self_test, trace};
use nix::fcntl::{OFlag, open};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};
use nix::sys::stat::Mode;
use nix::unistd::close;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

pub const DEFAULT_DAX_PATH: &str = "/dev/dax1.0";
pub const DEFAULT_DAX_OFFSET: u64 = 81 << 30;
pub const DEFAULT_DAX_LENGTH: usize = 1 << 30;

pub struct DaxArena {
    base: NonNull<u8>,
    length: usize,
    fd: RawFd,
    cursor: BumpCursor,
    debug: DebugLevel,
    path: PathBuf,
}

unsafe impl Send for DaxArena {}

impl DaxArena {
    /// Map `length` bytes of the device at `offset` and build an arena over
    /// the window.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - the path points to a device in devdax mode (MAP_SYNC capable)
    /// - `offset..offset + length` stays within the device
    /// - concurrent users of the same window follow a shared layout
    pub unsafe fn open(
        path: &Path,
        offset: u64,
        length: usize,
        debug: DebugLevel,
    ) -> Result<Self, ArenaError> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        if offset % page_size != 0 {
            return Err(ArenaError::UnalignedOffset { offset, page_size });
        }

        let owned_fd = open(path, OFlag::O_RDWR | OFlag::O_SYNC, Mode::empty())
            .map_err(|e| ArenaError::Io(io::Error::from_raw_os_error(e as i32)))?;

        // MAP_SHARED_VALIDATE makes the kernel reject unknown flags;
        // MAP_SYNC requests synchronous page faults on the DAX mapping.
        let map_shared_validate = MapFlags::from_bits_truncate(libc::MAP_SHARED_VALIDATE);
        let map_sync = MapFlags::from_bits_truncate(0x80000);
        let flags = map_shared_validate | map_sync;

        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(length).ok_or_else(|| {
                    ArenaError::Io(io::Error::new(io::ErrorKind::InvalidInput, "length is zero"))
                })?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                flags,
                &BorrowedFd::borrow_raw(owned_fd),
                offset as i64,
            )
        }
        .map_err(|e| ArenaError::Io(io::Error::from_raw_os_error(e as i32)))?;

        let base = NonNull::new(ptr.as_ptr().cast::<u8>()).unwrap();
        let fd = owned_fd;
        let cursor = BumpCursor::new(base, length);

        trace(
            debug,
            DebugLevel::Low,
            format_args!(
                "dax map ok: path={} offset={offset:#x} length={length:#x} addr={:p}",
                path.display(),
                base.as_ptr()
            ),
        );

        Ok(Self {
            base,
            length,
            fd,
            cursor,
            debug,
            path: path.to_path_buf(),
        })
    }

    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, ArenaError> {
        let p = self.cursor.alloc(bytes, 1)?;
        trace(
            self.debug,
            DebugLevel::High,
            format_args!("allocate({bytes}) -> {:p}", p.as_ptr()),
        );
        Ok(p)
    }

    pub fn allocate_aligned(
        &mut self,
        bytes: usize,
        align: usize,
    ) -> Result<NonNull<u8>, ArenaError> {
        let p = self.cursor.alloc(bytes, align)?;
        trace(
            self.debug,
            DebugLevel::High,
            format_args!("allocate_aligned({bytes}, align={align}) -> {:p}", p.as_ptr()),
        );
        Ok(p)
    }

    pub fn used(&self) -> usize {
        self.cursor.used()
    }

    pub fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    pub fn capacity(&self) -> usize {
        self.cursor.capacity()
    }

    /// Write-flush-read-back round trip on the first line of the window.
    pub fn test_memory(&mut self) -> bool {
        let ok = line_self_test(self.base, 0);
        trace(
            self.debug,
            DebugLevel::Low,
            format_args!("test_memory {}", if ok { "ok" } else { "failed" }),
        );
        ok
    }

    pub fn set_debug(&mut self, level: DebugLevel) {
        self.debug = level;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DaxArena {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base.cast(), self.length);
            let _ = close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires devdax hardware"]
    fn open_default_window() {
        let path = Path::new(DEFAULT_DAX_PATH);
        if !path.exists() {
            eprintln!("DAX device not found, skipping test");
            return;
        }

        unsafe {
            let mut arena =
                DaxArena::open(path, DEFAULT_DAX_OFFSET, DEFAULT_DAX_LENGTH, DebugLevel::Off)
                    .expect("failed to map dax window");
            assert!(arena.test_memory());

            let line = arena.allocate_aligned(64, 64).unwrap();
            assert_eq!(line.as_ptr() as usize % 64, 0);
        }
    }

    #[test]
    fn rejects_unaligned_offset() {
        let path = Path::new("/dev/null");
        match unsafe { DaxArena::open(path, 1, 4096, DebugLevel::Off) } {
            Err(ArenaError::UnalignedOffset { offset, .. }) => assert_eq!(offset, 1),
            other => panic!("expected UnalignedOffset, got {:?}", other.is_ok()),
        }
    }
}
