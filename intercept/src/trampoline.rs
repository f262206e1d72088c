//! Trampolines: relocated copies of a displaced prologue that jump back into
//! the untouched remainder of the original function.

use crate::arch::{Arch, InsnClass, RelocContext, DECODE_WINDOW};
use crate::code::{allocator, ExecSlot, ExecutableMemory};
use crate::error::{PatchError, Result};
use crate::relocate;
use log::{debug, warn};

/// A trampoline written into executable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trampoline {
    pub slot: ExecSlot,
    /// Bytes actually emitted.
    pub len: usize,
    /// `P`: bytes of the original function the trampoline replays.
    pub prefix_len: usize,
}

impl Trampoline {
    pub fn addr(&self) -> usize {
        self.slot.addr()
    }
}

/// Length of the function at the start of `window`, anchored at `origin`.
///
/// The scan follows forward branches ("reach") and ends at the first
/// return, jump or trap at or past the reach. It also ends where another
/// function visibly starts: a landing marker, or a frame-setup prologue
/// right after a terminator. No-op padding after the last terminator is
/// counted in.
pub fn discover_length<A: Arch>(window: &[u8], origin: u64) -> usize {
    let limit = window.len();
    let mut off = 0usize;
    let mut reach = origin;
    let mut after_terminator = false;

    while off < limit {
        let end = (off + DECODE_WINDOW).min(limit);
        let pc = origin + off as u64;
        if after_terminator && A::is_frame_setup(&window[off..end]) {
            return off;
        }
        let insn = match A::decode(&window[off..end], pc) {
            Ok(insn) => insn,
            Err(e) => {
                if off == 0 || !after_terminator {
                    warn!("length scan of {origin:#x} stopped at +{off:#x}: {e}");
                }
                return off;
            }
        };
        if off > 0 && insn.class == InsnClass::FunctionEntry {
            return off;
        }
        if after_terminator {
            if insn.class == InsnClass::Nop {
                off += insn.len;
                continue;
            }
            return off;
        }
        if let Some(t) = insn.target.filter(|_| insn.is_branch() && insn.class != InsnClass::Call) {
            if t > reach && t < origin + limit as u64 {
                reach = t;
            }
        }
        off += insn.len;
        if insn.is_terminator() && insn.end() > reach {
            after_terminator = true;
        }
    }
    if !after_terminator {
        warn!("length scan of {origin:#x} hit the {limit}-byte cap");
    }
    limit
}

/// Read the function at `origin`: `known_len` bytes if the caller knows its
/// size, otherwise as far as [`discover_length`] reaches within `max_scan`.
///
/// `overlay` replaces bytes at an offset before the length scan, so a
/// function that is currently patched is read as it was originally.
///
/// # Safety
/// `origin` must point to code.
pub unsafe fn read_function<A: Arch>(
    mem: &ExecutableMemory,
    origin: usize,
    known_len: Option<usize>,
    max_scan: usize,
    overlay: Option<(usize, &[u8])>,
) -> Vec<u8> {
    let readable = allocator::readable_extent(origin).unwrap_or(max_scan);
    let mut window = mem.raw_read(origin, known_len.unwrap_or(max_scan).min(readable));
    if let Some((at, bytes)) = overlay {
        if let Some(dst) = window.get_mut(at..at + bytes.len()) {
            dst.copy_from_slice(bytes);
        }
    }
    if known_len.is_none() {
        let len = discover_length::<A>(&window, origin as u64);
        debug!("function at {origin:#x} is {len} bytes");
        window.truncate(len);
    }
    window
}

/// Build a trampoline for the function `code` (anchored at `origin`) whose
/// first `jump_len` bytes a redirect will overwrite.
///
/// `capacity` caps the trampoline size; exceeding it is `SpaceOverflow`.
pub fn build<A: Arch>(
    mem: &ExecutableMemory,
    origin: usize,
    code: &[u8],
    jump_len: usize,
    capacity: usize,
    allow_widening: bool,
) -> Result<Trampoline> {
    if jump_len >= code.len() {
        return Err(PatchError::FunctionTooShort { target: origin, len: code.len(), needed: jump_len });
    }
    let prefix = relocate::select_prefix::<A>(code, origin as u64, jump_len)?;
    relocate::check_internal_branches::<A>(code, origin as u64, &prefix)?;
    let ctx = RelocContext { scratch: A::scratch_register(code), allow_widening };

    let near = Some((origin, A::NEAR_RANGE as usize));
    let slot = match mem.acquire(capacity, near)? {
        Some(slot) => slot,
        None => {
            debug!("no space near {origin:#x}, placing trampoline anywhere");
            mem.acquire_any(capacity)?
        }
    };

    let relocated = relocate::emit::<A>(code, origin as u64, &prefix, slot.addr() as u64, &ctx, code.len())?;
    if relocated.bytes.len() > capacity {
        return Err(PatchError::SpaceOverflow { needed: relocated.bytes.len(), available: capacity });
    }
    mem.write(&slot, &relocated.bytes)?;
    debug!(
        "trampoline for {origin:#x} at {:#x}: {} bytes replaying {} ({} pass(es))",
        slot.addr(),
        relocated.bytes.len(),
        relocated.prefix_len,
        relocated.passes
    );
    Ok(Trampoline { slot, len: relocated.bytes.len(), prefix_len: relocated.prefix_len })
}
