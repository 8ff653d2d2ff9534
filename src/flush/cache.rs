#![allow(unsafe_code)]
//! Cache-line write-back and invalidate over raw region memory.

use std::sync::atomic::{fence, Ordering};

use crate::region::descriptor::CACHE_LINE;

/// Writes back every cache line overlapping `[ptr, ptr + len)`.
///
/// # Safety
///
/// The range must lie inside a live mapping.
pub(crate) unsafe fn writeback(ptr: *const u8, len: usize) {
    flush_lines(ptr, len);
}

/// Drops every cache line overlapping `[ptr, ptr + len)` so the next load
/// comes from the backing medium.
///
/// # Safety
///
/// The range must lie inside a live mapping.
pub(crate) unsafe fn invalidate(ptr: *const u8, len: usize) {
    // clflush both writes back and evicts; a clean line is simply dropped.
    flush_lines(ptr, len);
}

/// Number of cache lines touched by a range.
pub(crate) fn lines_in(addr: usize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let start = addr & !(CACHE_LINE - 1);
    let end = (addr + len + CACHE_LINE - 1) & !(CACHE_LINE - 1);
    (end - start) / CACHE_LINE
}

#[cfg(target_arch = "x86_64")]
unsafe fn flush_lines(ptr: *const u8, len: usize) {
    use std::arch::x86_64::{_mm_clflush, _mm_mfence};
    if len == 0 {
        return;
    }
    let start = (ptr as usize) & !(CACHE_LINE - 1);
    let lines = lines_in(ptr as usize, len);
    _mm_mfence();
    for line in 0..lines {
        _mm_clflush((start + line * CACHE_LINE) as *const u8);
    }
    _mm_mfence();
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn flush_lines(_ptr: *const u8, _len: usize) {
    fence(Ordering::SeqCst);
}

/// Full fence ordering region stores against later flushes and loads.
pub(crate) fn full_fence() {
    fence(Ordering::SeqCst);
}
