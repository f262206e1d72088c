/// Code address behind a function pointer.
///
/// On arm64e the pointer may carry a pointer-authentication signature in its
/// upper bits; `xpaci` strips it. Everywhere else this is the identity.
#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
#[inline]
pub fn strip_code_ptr(ptr: usize) -> usize {
    let mut x = ptr as u64;
    unsafe {
        core::arch::asm!("xpaci {0}", inout(reg) x, options(nostack, preserves_flags));
    }
    x as usize
}

#[cfg(not(all(target_arch = "aarch64", target_os = "macos")))]
#[inline]
pub fn strip_code_ptr(ptr: usize) -> usize {
    ptr
}

