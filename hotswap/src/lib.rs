//! hotswap: redirect functions at run time, keeping the original callable.
//!
//! ```ignore
//! static ORIGINAL: Trampoline<fn(i64) -> i64> = Trampoline::new();
//!
//! fn louder(x: i64) -> i64 {
//!     ORIGINAL.get().map_or(0, |f| f(x)) + 100
//! }
//!
//! let guard = unsafe { hotswap::patch_with_trampoline(double as fn(i64) -> i64, louder, &ORIGINAL)? };
//! guard.apply()?;
//! ```

pub mod preflight;
pub mod signature;
pub mod slot;
pub mod symbols;

pub use hotswap_intercept::{Engine, EngineConfig, Guard, PatchError, Result, VtableInterceptor};
pub use preflight::{check_inlining, Inlining};
pub use signature::{check_compatible, FnSignature, Layout};
pub use slot::Trampoline;
pub use symbols::{Symbol, SymbolTable};

use hotswap_intercept::PatchRequest;
use log::debug;

/// Typed patching against one engine.
#[derive(Debug, Clone, Copy)]
pub struct Patcher<'e> {
    engine: &'e Engine,
}

impl<'e> Patcher<'e> {
    pub fn new(engine: &'e Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &'e Engine {
        self.engine
    }

    /// Register `replacement` for `target`. Call [`Guard::apply`] to activate it.
    ///
    /// # Safety
    /// `target` must not be running code that relies on its first bytes
    /// staying put, and it must not be inlined at the call sites of interest.
    pub unsafe fn patch<F: FnSignature>(&self, target: F, replacement: F) -> Result<Guard<'e>> {
        self.engine.patch(target.addr(), replacement.addr())
    }

    /// Like [`patch`](Self::patch), for a replacement of another nominal type
    /// with the same argument and return layouts.
    ///
    /// # Safety
    /// See [`patch`](Self::patch).
    pub unsafe fn patch_compatible<F: FnSignature, G: FnSignature>(&self, target: F, replacement: G) -> Result<Guard<'e>> {
        check_compatible::<F, G>()?;
        self.engine.patch(target.addr(), replacement.addr())
    }

    /// Patch and bind `slot` to a trampoline running the original `target`.
    ///
    /// # Safety
    /// See [`patch`](Self::patch).
    pub unsafe fn patch_with_trampoline<F: FnSignature>(
        &self,
        target: F,
        replacement: F,
        slot: &'static Trampoline<F>,
    ) -> Result<Guard<'e>> {
        self.engine.patch_request(PatchRequest::new(target.addr(), replacement.addr()).slot(slot))
    }

    /// Patch a function found by name in `table`, using its recorded size.
    ///
    /// # Safety
    /// The symbol must name a function whose layout matches `G`.
    pub unsafe fn patch_symbol<G: FnSignature>(
        &self,
        table: &SymbolTable,
        name: &str,
        replacement: G,
        slot: Option<&'static Trampoline<G>>,
    ) -> Result<Guard<'e>> {
        let sym = table.lookup(name)?;
        debug!("{name} resolved to {:#x} ({} bytes)", sym.address, sym.size);
        let mut req = PatchRequest::new(sym.address, replacement.addr());
        if sym.size > 0 {
            req = req.size(sym.size);
        }
        if let Some(slot) = slot {
            req = req.slot(slot);
        }
        self.engine.patch_request(req)
    }
}

/// [`Patcher::patch`] on the global engine.
///
/// # Safety
/// See [`Patcher::patch`].
pub unsafe fn patch<F: FnSignature>(target: F, replacement: F) -> Result<Guard<'static>> {
    Patcher::new(Engine::global()).patch(target, replacement)
}

/// [`Patcher::patch_compatible`] on the global engine.
///
/// # Safety
/// See [`Patcher::patch`].
pub unsafe fn patch_compatible<F: FnSignature, G: FnSignature>(target: F, replacement: G) -> Result<Guard<'static>> {
    Patcher::new(Engine::global()).patch_compatible(target, replacement)
}

/// [`Patcher::patch_with_trampoline`] on the global engine.
///
/// # Safety
/// See [`Patcher::patch`].
pub unsafe fn patch_with_trampoline<F: FnSignature>(
    target: F,
    replacement: F,
    slot: &'static Trampoline<F>,
) -> Result<Guard<'static>> {
    Patcher::new(Engine::global()).patch_with_trampoline(target, replacement, slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hint::black_box;
    use std::sync::{Mutex, OnceLock};

    fn serial() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
    }

    fn engine() -> Engine {
        let _ = env_logger::builder().is_test(true).try_init();
        Engine::new(EngineConfig::default())
    }

    #[inline(never)]
    fn double(i: i64) -> i64 {
        black_box(i).wrapping_mul(2)
    }

    #[inline(never)]
    fn triple(i: i64) -> i64 {
        black_box(i).wrapping_mul(3)
    }

    #[inline(never)]
    fn halve(i: i64) -> i64 {
        black_box(i) / 2
    }

    static ORIGINAL_HALVE: Trampoline<fn(i64) -> i64> = Trampoline::new();

    fn halve_plus_100(i: i64) -> i64 {
        ORIGINAL_HALVE.get().map_or(-1, |f| f(i)) + 100
    }

    #[inline(never)]
    fn countdown(n: u64) -> u64 {
        if black_box(n) == 0 {
            0
        } else {
            1 + countdown(n - 1)
        }
    }

    static ORIGINAL_COUNTDOWN: Trampoline<fn(u64) -> u64> = Trampoline::new();

    fn countdown_via_original(n: u64) -> u64 {
        ORIGINAL_COUNTDOWN.get().map_or(u64::MAX, |f| f(n)) * 10
    }

    #[inline(never)]
    fn split(x: u64) -> (u64, u64) {
        let x = black_box(x);
        (x >> 32, x & 0xFFFF_FFFF)
    }

    static ORIGINAL_SPLIT: Trampoline<fn(u64) -> (u64, u64)> = Trampoline::new();

    fn split_swapped(x: u64) -> (u64, u64) {
        let (hi, lo) = ORIGINAL_SPLIT.get().map_or((0, 0), |f| f(x));
        (lo, hi)
    }

    #[inline(never)]
    extern "C" fn add_one(x: u32) -> u32 {
        black_box(x).wrapping_add(1)
    }

    extern "C" fn sub_one(x: i32) -> i32 {
        x.wrapping_sub(1)
    }

    #[no_mangle]
    #[inline(never)]
    extern "C" fn hotswap_lib_symbol_target(x: i64) -> i64 {
        black_box(x) + 7
    }

    extern "C" fn symbol_replacement(x: i64) -> i64 {
        x - 7
    }

    fn call<A, R>(f: fn(A) -> R, a: A) -> R {
        black_box(f)(a)
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn compiled_function_scenario() {
        let _s = serial();
        let engine = engine();
        let p = Patcher::new(&engine);
        unsafe {
            let guard = p.patch(double as fn(i64) -> i64, triple).unwrap();
            guard.apply().unwrap();
            assert_eq!(call(double, 1), 3);
            guard.unpatch().unwrap();
            assert_eq!(call(double, 1), 2);
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn trampoline_keeps_the_original_callable() {
        let _s = serial();
        let engine = engine();
        let p = Patcher::new(&engine);
        unsafe {
            let guard = p.patch_with_trampoline(halve as fn(i64) -> i64, halve_plus_100, &ORIGINAL_HALVE).unwrap();
            guard.apply().unwrap();
            for (input, expected) in [(0, 100), (-7, 97), (9, 104), (i64::MAX, i64::MAX / 2 + 100)] {
                assert_eq!(call(halve, input), expected);
            }
            drop(guard);
            assert!(!ORIGINAL_HALVE.is_bound());
            assert_eq!(call(halve, 9), 4);
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn recursive_target_through_its_trampoline() {
        let _s = serial();
        let engine = engine();
        let p = Patcher::new(&engine);
        unsafe {
            let guard = p
                .patch_with_trampoline(countdown as fn(u64) -> u64, countdown_via_original, &ORIGINAL_COUNTDOWN)
                .unwrap();
            let original = ORIGINAL_COUNTDOWN.get().unwrap();
            assert_eq!(original(3), 3, "trampoline matches the unpatched function");
            guard.apply().unwrap();
            // The trampoline's own recursive call lands on the patched entry again.
            assert_eq!(call(countdown, 0), 0);
            assert_eq!(call(countdown, 1), 10);
            assert_eq!(call(countdown, 2), 110);
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn multi_value_return_through_the_trampoline() {
        let _s = serial();
        let engine = engine();
        let p = Patcher::new(&engine);
        unsafe {
            let guard = p.patch_with_trampoline(split as fn(u64) -> (u64, u64), split_swapped, &ORIGINAL_SPLIT).unwrap();
            guard.apply().unwrap();
            assert_eq!(call(split, 0x0000_0001_0000_0002), (2, 1));
            guard.unpatch().unwrap();
            assert_eq!(call(split, 0x0000_0001_0000_0002), (1, 2));
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn compatible_but_nominally_different_replacement() {
        let _s = serial();
        let engine = engine();
        let p = Patcher::new(&engine);
        unsafe {
            let guard = p.patch_compatible(add_one as extern "C" fn(u32) -> u32, sub_one as extern "C" fn(i32) -> i32).unwrap();
            guard.apply().unwrap();
            assert_eq!(black_box(add_one as extern "C" fn(u32) -> u32)(10), 9);
        }
        let err = unsafe { p.patch_compatible(double as fn(i64) -> i64, sub_one as extern "C" fn(i32) -> i32).unwrap_err() };
        assert!(matches!(err, PatchError::SignatureMismatch { .. }));
        assert!(!engine.is_patched(double as usize));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn patch_by_symbol_name() {
        let _s = serial();
        let engine = engine();
        let p = Patcher::new(&engine);
        let table = SymbolTable::current_exe().unwrap();
        let target: extern "C" fn(i64) -> i64 = hotswap_lib_symbol_target;
        unsafe {
            let guard = p.patch_symbol(&table, "hotswap_lib_symbol_target", symbol_replacement as extern "C" fn(i64) -> i64, None).unwrap();
            guard.apply().unwrap();
            assert_eq!(black_box(target)(10), 3);
            drop(guard);
            assert_eq!(black_box(target)(10), 17);

            let err = p.patch_symbol(&table, "hotswap_lib_symbol_targt", symbol_replacement as extern "C" fn(i64) -> i64, None)
                .unwrap_err();
            match err {
                PatchError::SymbolNotFound { suggestions, .. } => {
                    assert!(suggestions.iter().any(|s| s == "hotswap_lib_symbol_target"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
