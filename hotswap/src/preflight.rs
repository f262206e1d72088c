//! Detects whether the build inlines small functions.
//!
//! Patching a function only affects call sites that still call it. A build
//! that inlines aggressively leaves few such call sites for short functions.

use hotswap_intercept::arch::{decode_all, HostArch, InsnClass};
use hotswap_intercept::code::ptrauth::strip_code_ptr;
use hotswap_intercept::trampoline::read_function;
use hotswap_intercept::Engine;
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inlining {
    /// The probe still calls its callee.
    Disabled,
    /// The callee was folded into the probe.
    Detected,
}

#[inline]
fn preflight_leaf(x: u64) -> u64 {
    (x ^ 0x5a).rotate_left(7)
}

#[inline(never)]
fn preflight_probe(x: u64) -> u64 {
    preflight_leaf(x).wrapping_add(1)
}

/// Run the probe and look for a call in its machine code.
pub fn check_inlining() -> Inlining {
    let probe: fn(u64) -> u64 = preflight_probe;
    let out = std::hint::black_box(probe)(3);
    debug!("preflight probe returned {out:#x}");

    let addr = strip_code_ptr(probe as usize);
    // SAFETY: the probe is a function of this binary, so its code is mapped.
    let code = unsafe { read_function::<HostArch>(Engine::global().memory(), addr, None, 512, None) };
    let (insns, _) = decode_all::<HostArch>(&code, addr as u64);
    if insns.iter().any(|i| i.class == InsnClass::Call) {
        Inlining::Disabled
    } else {
        warn!("small functions are being inlined; patches may not reach every call site (build with opt-level 0 or mark targets #[inline(never)])");
        Inlining::Detected
    }
}
