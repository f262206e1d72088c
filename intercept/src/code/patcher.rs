use crate::code::allocator::{last_errno, page_size};
use crate::code::cache::invalidate_icache;
use crate::error::{PatchError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Page-aligned `(start, len)` covering `[addr, addr + size)`.
fn page_range(addr: usize, size: usize) -> (usize, usize) {
    let page_sz = page_size();
    let start = addr & !(page_sz - 1);
    let end = (addr + size + page_sz - 1) & !(page_sz - 1);
    (start, (end - start).max(page_sz))
}

/// Store `bytes` at `addr`.
///
/// A write that fits inside one aligned 8-byte word lands as a single atomic
/// store, so a thread fetching those bytes sees either the old or the new
/// instruction and never a mix.
unsafe fn store(addr: *mut u8, bytes: &[u8]) {
    let start = addr as usize;
    let word = start & !7;
    if start + bytes.len() <= word + 8 {
        let cell = &*(word as *const AtomicU64);
        let off = start - word;
        let mut buf = cell.load(Ordering::Relaxed).to_le_bytes();
        buf[off..off + bytes.len()].copy_from_slice(bytes);
        cell.store(u64::from_le_bytes(buf), Ordering::Release);
    } else {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr, bytes.len());
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    pub unsafe fn write_code(addr: *mut u8, bytes: &[u8]) -> Result<()> {
        let (page_start, map_size) = page_range(addr as usize, bytes.len());

        // RWX so code sharing the page keeps executing while we write.
        if libc::mprotect(
            page_start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ) != 0
        {
            return Err(PatchError::Protection { addr: page_start, errno: last_errno() });
        }

        store(addr, bytes);

        if libc::mprotect(page_start as *mut libc::c_void, map_size, libc::PROT_READ | libc::PROT_EXEC) != 0 {
            return Err(PatchError::Protection { addr: page_start, errno: last_errno() });
        }

        // Whole pages: neighbours on the same page may have been patched separately.
        invalidate_icache(page_start as *mut u8, map_size);
        Ok(())
    }
}

#[cfg(target_os = "macos")]
mod darwin {
    use super::*;
    use mach2::kern_return::KERN_SUCCESS;
    use mach2::traps::mach_task_self;
    use mach2::vm::mach_vm_protect;
    use mach2::vm_prot::{VM_PROT_COPY, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
    use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};

    pub unsafe fn write_code(addr: *mut u8, bytes: &[u8]) -> Result<()> {
        let (page_start, map_size) = page_range(addr as usize, bytes.len());

        if libc::mprotect(
            page_start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ) == 0
        {
            store(addr, bytes);
        } else {
            // Signed text refuses RWX; take a private RW copy of the page instead.
            log::debug!("mprotect RWX refused at {page_start:#x}, using mach_vm_protect");
            let task = mach_task_self();
            let kr = mach_vm_protect(
                task,
                page_start as mach_vm_address_t,
                map_size as mach_vm_size_t,
                0,
                VM_PROT_READ | VM_PROT_WRITE | VM_PROT_COPY,
            );
            if kr != KERN_SUCCESS {
                return Err(PatchError::Protection { addr: page_start, errno: kr });
            }
            store(addr, bytes);
        }

        let kr = mach_vm_protect(
            mach_task_self(),
            page_start as mach_vm_address_t,
            map_size as mach_vm_size_t,
            0,
            VM_PROT_READ | VM_PROT_EXECUTE,
        );
        if kr != KERN_SUCCESS {
            return Err(PatchError::Protection { addr: page_start, errno: kr });
        }
        invalidate_icache(addr, bytes.len());
        Ok(())
    }
}

/// Overwrite `bytes.len()` bytes of executable code at `addr`.
///
/// The covering pages go R-X → writable → R-X and the instruction cache is
/// flushed before returning.
///
/// # Safety
/// `addr` must point to mapped code the caller owns for the duration of the
/// write; no other thread may be writing the same pages.
pub unsafe fn write_code(addr: *mut u8, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    #[cfg(target_os = "linux")]
    {
        linux::write_code(addr, bytes)
    }
    #[cfg(target_os = "macos")]
    {
        darwin::write_code(addr, bytes)
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = (addr, bytes);
        Err(PatchError::Protection { addr: addr as usize, errno: libc::ENOSYS })
    }
}
