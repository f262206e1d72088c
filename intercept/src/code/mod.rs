//! Executable memory: slot allocation, protected writes and locked reads.

pub mod allocator;
pub mod cache;
pub mod patcher;
pub mod placeholder;
pub mod ptrauth;

use crate::error::{PatchError, Result};
use allocator::{CodeAllocator, CodeSlice};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};

/// Slot granularity.
const SLOT_ALIGN: usize = 16;

/// A run of executable bytes owned by one trampoline, relay or stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecSlot {
    addr: usize,
    capacity: usize,
}

impl ExecSlot {
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn end(&self) -> usize {
        self.addr + self.capacity
    }
}

#[derive(Debug)]
struct Mapping {
    slice: CodeSlice,
    used: usize,
}

impl Mapping {
    fn free(&self) -> usize {
        self.slice.size - self.used
    }
}

fn within(addr: usize, len: usize, near: Option<(usize, usize)>) -> bool {
    match near {
        None => true,
        Some((origin, range)) => addr.abs_diff(origin) <= range && (addr + len).abs_diff(origin) <= range,
    }
}

/// Owner of every executable byte the engine hands out.
///
/// Slots bump forward inside the placeholder region first, then inside
/// anonymous mappings. Nothing is ever unmapped: a thread may still be
/// executing in a trampoline after its patch was removed.
#[derive(Debug)]
pub struct ExecutableMemory {
    allocator: CodeAllocator,
    mappings: Mutex<Vec<Mapping>>,
    /// Held for writing while code bytes change; raw readers take it shared.
    code_lock: RwLock<()>,
    use_placeholder: bool,
}

impl ExecutableMemory {
    pub fn new(mapping_size: usize, use_placeholder: bool) -> Self {
        Self {
            allocator: CodeAllocator::new(mapping_size),
            mappings: Mutex::new(Vec::new()),
            code_lock: RwLock::new(()),
            use_placeholder,
        }
    }

    /// Reserve `size` bytes, optionally within `range` bytes of `origin`.
    ///
    /// With a `near` constraint this returns `Ok(None)` when no reachable
    /// space exists; without one it maps fresh memory or fails.
    pub fn acquire(&self, size: usize, near: Option<(usize, usize)>) -> Result<Option<ExecSlot>> {
        let capacity = size.max(1).next_multiple_of(SLOT_ALIGN);

        if self.use_placeholder {
            if let Some((start, end)) = placeholder::region() {
                if within(start, 0, near) || within(end, 0, near) {
                    if let Some(addr) = placeholder::take_where(capacity, |addr| within(addr, capacity, near)) {
                        trace!("placeholder slot {addr:#x}+{capacity}");
                        return Ok(Some(ExecSlot { addr, capacity }));
                    }
                }
            }
        }

        let mut mappings = self.mappings.lock();
        for m in mappings.iter_mut() {
            let addr = m.slice.base + m.used;
            if m.free() >= capacity && within(addr, capacity, near) {
                m.used += capacity;
                return Ok(Some(ExecSlot { addr, capacity }));
            }
        }

        let slice = match near {
            Some((origin, range)) => match self.allocator.alloc_near(origin, range, capacity)? {
                Some(slice) => slice,
                None => {
                    debug!("no executable space within {range:#x} of {origin:#x}");
                    return Ok(None);
                }
            },
            None => self.allocator.alloc_any(capacity)?,
        };
        unsafe {
            // Fill with traps so a stray jump into unused space faults.
            core::ptr::write_bytes(slice.base as *mut u8, TRAP_FILL, slice.size);
            self.allocator.make_executable(&slice)?;
        }
        debug!("mapped {} bytes of executable memory at {:#x}", slice.size, slice.base);
        let slot = ExecSlot { addr: slice.base, capacity };
        mappings.push(Mapping { slice, used: capacity });
        Ok(Some(slot))
    }

    /// Like [`acquire`](Self::acquire) without a placement constraint.
    pub fn acquire_any(&self, size: usize) -> Result<ExecSlot> {
        self.acquire(size, None)?
            .ok_or_else(|| PatchError::Allocation(format!("no space for {size} bytes")))
    }

    /// Write `bytes` at the start of `slot`.
    pub fn write(&self, slot: &ExecSlot, bytes: &[u8]) -> Result<()> {
        if bytes.len() > slot.capacity {
            return Err(PatchError::SpaceOverflow { needed: bytes.len(), available: slot.capacity });
        }
        // SAFETY: the slot belongs to this manager and is mapped for its capacity.
        unsafe { self.write_code(slot.addr, bytes) }
    }

    /// Overwrite code anywhere in the process.
    ///
    /// # Safety
    /// `addr..addr + bytes.len()` must be mapped code.
    pub unsafe fn write_code(&self, addr: usize, bytes: &[u8]) -> Result<()> {
        let _w = self.code_lock.write();
        trace!("write {} bytes at {addr:#x}", bytes.len());
        patcher::write_code(addr as *mut u8, bytes)
    }

    /// Copy `len` bytes out from `addr` while no write is in progress.
    ///
    /// # Safety
    /// `addr..addr + len` must be readable.
    pub unsafe fn raw_read(&self, addr: usize, len: usize) -> Vec<u8> {
        let _r = self.code_lock.read();
        crate::view::copy_out(addr, len)
    }

    /// Total bytes handed out from anonymous mappings.
    pub fn mapped_bytes(&self) -> usize {
        self.mappings.lock().iter().map(|m| m.slice.size).sum()
    }

    /// Whether `addr` lies in memory this manager hands out.
    pub fn owns(&self, addr: usize) -> bool {
        if let Some((start, end)) = placeholder::region() {
            if (start..end).contains(&addr) {
                return true;
            }
        }
        self.mappings.lock().iter().any(|m| m.slice.contains(addr))
    }
}

#[cfg(target_arch = "x86_64")]
const TRAP_FILL: u8 = 0xCC;
#[cfg(not(target_arch = "x86_64"))]
const TRAP_FILL: u8 = 0x00;
