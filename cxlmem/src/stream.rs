//! 64-byte line transport for cache-coherent but high-latency shared memory.
//!
//! Ordinary cached loads may be satisfied from a stale local line and
//! ordinary cached stores may dwell in the local cache indefinitely, so
//! every access to a shared line goes through one of these helpers:
//! streaming stores that post the write toward shared memory, and
//! invalidating loads that force the next read to re-fetch the coherent
//! copy. A 64-byte publication is not atomic; torn observation is the
//! caller's problem (the queue closes it with a whole-line checksum).

use std::sync::OnceLock;

/// Cache-line invalidation instructions available on x86_64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateMethod {
    /// CLFLUSHOPT - weakly ordered eviction (preferred)
    ClflushOpt,
    /// CLFLUSH - strongly ordered eviction
    Clflush,
}

static INVALIDATE_METHOD: OnceLock<InvalidateMethod> = OnceLock::new();

/// Detect the best available invalidation instruction using CPUID.
///
/// CLWB is not considered: it writes the line back but leaves it cached, so
/// a later load could still be satisfied locally. The reader needs eviction.
pub fn detect_invalidate_method() -> InvalidateMethod {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::__cpuid;

        // CPUID.07H:EBX.CLFLUSHOPT[bit 23]
        let cpuid_7 = __cpuid(7);
        if (cpuid_7.ebx & (1 << 23)) != 0 {
            return InvalidateMethod::ClflushOpt;
        }

        InvalidateMethod::Clflush
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        InvalidateMethod::Clflush
    }
}

fn invalidate_method() -> InvalidateMethod {
    *INVALIDATE_METHOD.get_or_init(detect_invalidate_method)
}

/// Evict the line containing `line` from the local cache hierarchy, then
/// fence, so the next load re-fetches from the coherent shared copy.
///
/// # Safety
///
/// `line` must point into a mapped, readable region.
#[inline]
pub unsafe fn invalidate_line(line: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        match invalidate_method() {
            InvalidateMethod::ClflushOpt => {
                std::arch::asm!(
                    "clflushopt [{addr}]",
                    addr = in(reg) line,
                    options(nostack)
                );
            }
            InvalidateMethod::Clflush => {
                std::arch::asm!(
                    "clflush [{addr}]",
                    addr = in(reg) line,
                    options(nostack)
                );
            }
        }
        std::arch::asm!("sfence", options(nostack));
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = line;
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Copy 64 bytes from local `src` to shared `dst` with non-temporal stores,
/// then fence. A later [`observe_line`] on any core sees this value or a
/// strictly newer one; no atomicity is claimed for the 64 bytes.
///
/// # Safety
///
/// Both pointers must be 64-byte aligned and valid for 64 bytes, and must
/// not alias.
#[inline]
pub unsafe fn publish_line(dst: *mut u8, src: *const u8) {
    debug_assert_eq!(dst as usize & 63, 0, "dst is not 64-byte aligned");
    debug_assert_eq!(src as usize & 63, 0, "src is not 64-byte aligned");

    #[cfg(target_arch = "x86_64")]
    unsafe {
        let s = src.cast::<u64>();
        let d = dst.cast::<u64>();
        for i in 0..8 {
            std::arch::asm!(
                "movnti [{addr}], {val}",
                addr = in(reg) d.add(i),
                val = in(reg) s.add(i).read(),
                options(nostack)
            );
        }
        std::arch::asm!("sfence", options(nostack));
    }

    #[cfg(not(target_arch = "x86_64"))]
    unsafe {
        let s = src.cast::<u64>();
        let d = dst.cast::<u64>();
        for i in 0..8 {
            d.add(i).write_volatile(s.add(i).read());
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Invalidate the line at `src`, fence, then copy 64 bytes into local
/// `dst`. The read is guaranteed not to be satisfied from the local cache.
///
/// # Safety
///
/// Both pointers must be 64-byte aligned and valid for 64 bytes, and must
/// not alias.
#[inline]
pub unsafe fn observe_line(dst: *mut u8, src: *const u8) {
    debug_assert_eq!(dst as usize & 63, 0, "dst is not 64-byte aligned");
    debug_assert_eq!(src as usize & 63, 0, "src is not 64-byte aligned");

    unsafe {
        invalidate_line(src);
        let s = src.cast::<u64>();
        let d = dst.cast::<u64>();
        for i in 0..8 {
            d.add(i).write(s.add(i).read_volatile());
        }
    }
}

/// Streaming 8-byte scalar store, then fence.
///
/// # Safety
///
/// `dst` must be 8-byte aligned and valid for writes of 8 bytes.
#[inline]
pub unsafe fn publish_u64(dst: *mut u64, value: u64) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::asm!(
            "movnti [{addr}], {val}",
            addr = in(reg) dst,
            val = in(reg) value,
            options(nostack)
        );
        std::arch::asm!("sfence", options(nostack));
    }

    #[cfg(not(target_arch = "x86_64"))]
    unsafe {
        dst.write_volatile(value);
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Invalidate the line containing `src`, fence, then read 8 bytes.
///
/// # Safety
///
/// `src` must be 8-byte aligned and valid for reads of 8 bytes.
#[inline]
pub unsafe fn observe_u64(src: *const u64) -> u64 {
    unsafe {
        invalidate_line(src.cast());
        src.read_volatile()
    }
}

/// Spin the current core for roughly `cycles` pause hints without
/// generating any load or store to memory.
#[inline]
pub fn pause_cycles(cycles: u32) {
    for _ in 0..cycles {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(64))]
    struct Line([u8; 64]);

    #[test]
    fn line_round_trip() {
        let src = Line(std::array::from_fn(|i| i as u8));
        let mut shared = Line([0; 64]);
        let mut dst = Line([0; 64]);
        unsafe {
            publish_line(shared.0.as_mut_ptr(), src.0.as_ptr());
            observe_line(dst.0.as_mut_ptr(), shared.0.as_ptr());
        }
        assert_eq!(src.0, dst.0);
    }

    #[test]
    fn scalar_round_trip() {
        let mut shared = Line([0; 64]);
        let p = shared.0.as_mut_ptr().cast::<u64>();
        unsafe {
            publish_u64(p, 0xDEAD_BEEF_F00D_CAFE);
            assert_eq!(observe_u64(p), 0xDEAD_BEEF_F00D_CAFE);
        }
    }

    #[test]
    fn detection_is_cached() {
        assert_eq!(invalidate_method(), invalidate_method());
    }

    #[test]
    fn pause_returns() {
        pause_cycles(0);
        pause_cycles(256);
    }
}
