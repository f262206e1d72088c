//! A pre-reserved run of padding inside the binary's own `.text`.
//!
//! Slots carved from here sit next to the code they redirect from, so a
//! short jump always reaches them. The region is shared by every engine in
//! the process and only ever bumps forward.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes reserved in `.text`.
pub const PLACEHOLDER_SIZE: usize = 64 * 1024;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
core::arch::global_asm!(
    ".pushsection .text.hotswap_placeholder,\"ax\",@progbits",
    ".p2align 12",
    ".globl hotswap_placeholder_start",
    ".hidden hotswap_placeholder_start",
    "hotswap_placeholder_start:",
    ".fill 65536, 1, 0xcc",
    ".popsection",
);

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
core::arch::global_asm!(
    ".pushsection .text.hotswap_placeholder,\"ax\",%progbits",
    ".p2align 12",
    ".globl hotswap_placeholder_start",
    ".hidden hotswap_placeholder_start",
    "hotswap_placeholder_start:",
    ".fill 16384, 4, 0",
    ".popsection",
);

#[cfg(target_os = "linux")]
extern "C" {
    static hotswap_placeholder_start: u8;
}

static CURSOR: AtomicUsize = AtomicUsize::new(0);

fn base() -> Option<usize> {
    #[cfg(target_os = "linux")]
    {
        Some(core::ptr::addr_of!(hotswap_placeholder_start) as usize)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// `[start, end)` of the region, if this platform has one.
pub fn region() -> Option<(usize, usize)> {
    base().map(|b| (b, b + PLACEHOLDER_SIZE))
}

/// Carve `size` bytes (rounded to 16) out of the region.
///
/// Returns `None` once the region is exhausted or it does not exist here.
pub fn take(size: usize) -> Option<usize> {
    take_where(size, |_| true)
}

/// Like [`take`], but only commits when `accept` approves the next address.
///
/// A refused address stays available to later callers.
pub fn take_where(size: usize, accept: impl Fn(usize) -> bool) -> Option<usize> {
    let base = base()?;
    bump(&CURSOR, size, |off| accept(base + off)).map(|off| base + off)
}

fn bump(cursor: &AtomicUsize, size: usize, accept: impl Fn(usize) -> bool) -> Option<usize> {
    let size = size.next_multiple_of(16);
    let mut cur = cursor.load(Ordering::Relaxed);
    loop {
        let next = cur.checked_add(size)?;
        if next > PLACEHOLDER_SIZE || !accept(cur) {
            return None;
        }
        match cursor.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return Some(cur),
            Err(seen) => cur = seen,
        }
    }
}

/// Bytes still available.
pub fn remaining() -> usize {
    if base().is_none() {
        return 0;
    }
    PLACEHOLDER_SIZE.saturating_sub(CURSOR.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn slots_are_inside_the_region_and_aligned() {
        let (start, end) = region().expect("linux has a placeholder");
        assert_eq!(start % 4096, 0);
        let a = take(5).expect("slot");
        let b = take(5).expect("slot");
        assert!(a >= start && b + 16 <= end);
        assert_eq!(a % 16, 0);
        assert!(b >= a + 16 || a >= b + 16);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn region_starts_as_trap_filler() {
        let (start, _) = region().unwrap();
        let last = unsafe { *((start + PLACEHOLDER_SIZE - 1) as *const u8) };
        #[cfg(target_arch = "x86_64")]
        assert_eq!(last, 0xCC);
        #[cfg(target_arch = "aarch64")]
        assert_eq!(last, 0);
    }

    #[test]
    fn refused_offsets_are_not_consumed() {
        let cursor = AtomicUsize::new(0);
        assert_eq!(bump(&cursor, 20, |_| false), None);
        assert_eq!(cursor.load(Ordering::Relaxed), 0);
        assert_eq!(bump(&cursor, 20, |off| off == 0), Some(0));
        assert_eq!(bump(&cursor, 20, |off| off == 0), None);
        assert_eq!(cursor.load(Ordering::Relaxed), 32);
    }

    #[test]
    fn oversized_requests_are_refused() {
        assert_eq!(take(PLACEHOLDER_SIZE + 1), None);
    }
}
