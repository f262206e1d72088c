//! The patch engine: registry of live patches keyed by target address.

use crate::arch::{Arch, HostArch};
use crate::code::ptrauth::strip_code_ptr;
use crate::code::{ExecSlot, ExecutableMemory};
use crate::config::EngineConfig;
use crate::error::{PatchError, Result};
use crate::guard::Guard;
use crate::{relocate, trampoline};
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// A caller-owned variable that learns the address of a trampoline.
pub trait TrampolineSlot: Send + Sync {
    /// Bytes the slot can host, if it imposes a limit.
    fn capacity(&self) -> Option<usize>;
    fn bind(&self, addr: usize);
    fn clear(&self);
}

/// What to patch and how.
#[derive(Clone, Copy)]
pub struct PatchRequest {
    pub target: usize,
    pub replacement: usize,
    /// Size of the target function when known (e.g. from a symbol table).
    pub size: Option<usize>,
    pub trampoline: bool,
    pub slot: Option<&'static dyn TrampolineSlot>,
}

impl PatchRequest {
    pub fn new(target: usize, replacement: usize) -> Self {
        Self { target, replacement, size: None, trampoline: false, slot: None }
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Build a trampoline so the original behavior stays callable.
    pub fn with_trampoline(mut self) -> Self {
        self.trampoline = true;
        self
    }

    /// Build a trampoline and publish its address through `slot`.
    pub fn slot(mut self, slot: &'static dyn TrampolineSlot) -> Self {
        self.trampoline = true;
        self.slot = Some(slot);
        self
    }
}

impl std::fmt::Debug for PatchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchRequest")
            .field("target", &format_args!("{:#x}", self.target))
            .field("replacement", &format_args!("{:#x}", self.replacement))
            .field("size", &self.size)
            .field("trampoline", &self.trampoline)
            .field("slot", &self.slot.is_some())
            .finish()
    }
}

pub(crate) struct Entry {
    pub(crate) id: u64,
    /// Where the redirect lands: the target, past any landing marker.
    pub(crate) patch_addr: usize,
    pub(crate) jump: Vec<u8>,
    pub(crate) original: Vec<u8>,
    pub(crate) trampoline: Option<usize>,
    pub(crate) slot: Option<&'static dyn TrampolineSlot>,
    pub(crate) applied: bool,
}

impl Entry {
    pub(crate) fn release_slot(&self) {
        if let Some(slot) = self.slot {
            slot.clear();
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) entries: HashMap<usize, Entry>,
}

/// Owns executable memory and the registry. All mutation of target code
/// happens with the registry lock held.
pub struct Engine {
    config: EngineConfig,
    memory: ExecutableMemory,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("config", &self.config).field("patches", &self.len()).finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Room for the longest absolute jump either backend emits.
const RELAY_SIZE: usize = 32;

/// Planned redirect for one target.
struct Redirect {
    patch_addr: usize,
    jump: Vec<u8>,
    /// Stub the jump goes through when the replacement is out of short range.
    relay: Option<(ExecSlot, Vec<u8>)>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            memory: ExecutableMemory::new(config.mapping_size, config.use_placeholder),
            config,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Process-wide engine, configured from the environment on first use.
    pub fn global() -> &'static Engine {
        static GLOBAL: OnceLock<Engine> = OnceLock::new();
        GLOBAL.get_or_init(|| Engine::new(EngineConfig::from_env()))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn memory(&self) -> &ExecutableMemory {
        &self.memory
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock()
    }

    /// Redirect `target` to `replacement`. The patch is registered but not applied.
    ///
    /// # Safety
    /// Both addresses must be entry points of functions with compatible
    /// calling conventions, and the target's code must stay mapped.
    pub unsafe fn patch(&self, target: usize, replacement: usize) -> Result<Guard<'_>> {
        self.patch_request(PatchRequest::new(target, replacement))
    }

    /// # Safety
    /// See [`patch`](Self::patch).
    pub unsafe fn patch_request(&self, req: PatchRequest) -> Result<Guard<'_>> {
        let target = strip_code_ptr(req.target);
        let replacement = strip_code_ptr(req.replacement);
        let mut reg = self.lock();

        // Decode the pristine function even if a previous patch is live.
        let overlay = reg
            .entries
            .get(&target)
            .filter(|e| e.applied)
            .map(|e| (e.patch_addr - target, e.original.clone()));
        let code = trampoline::read_function::<HostArch>(
            &self.memory,
            target,
            req.size,
            self.config.max_scan_len,
            overlay.as_ref().map(|(at, bytes)| (*at, bytes.as_slice())),
        );

        let redirect = self.plan_redirect(target, replacement, &code)?;
        let needed = redirect.patch_addr - target + redirect.jump.len();
        if needed >= code.len() {
            return Err(PatchError::FunctionTooShort { target, len: code.len(), needed });
        }
        let prefix = relocate::select_prefix::<HostArch>(&code, target as u64, needed)?;
        relocate::check_internal_branches::<HostArch>(&code, target as u64, &prefix)?;

        let tramp = if req.trampoline {
            let capacity = req.slot.and_then(|s| s.capacity()).unwrap_or(self.config.trampoline_capacity);
            Some(trampoline::build::<HostArch>(
                &self.memory,
                target,
                &code,
                needed,
                capacity,
                self.config.allow_widening,
            )?)
        } else {
            None
        };

        // The prior entry stays registered until its bytes are back, so a
        // failed restore leaves it reachable through `unpatch`.
        if let Some(prior) = reg.entries.get_mut(&target) {
            warn!("superseding patch of {target:#x}");
            if prior.applied {
                self.memory.write_code(prior.patch_addr, &prior.original)?;
                prior.applied = false;
            }
        }

        if let Some((slot, bytes)) = &redirect.relay {
            self.memory.write(slot, bytes)?;
        }

        if let Some(prior) = reg.entries.remove(&target) {
            prior.release_slot();
        }

        let skip = redirect.patch_addr - target;
        let original = code[skip..skip + redirect.jump.len()].to_vec();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let (Some(slot), Some(t)) = (req.slot, tramp.as_ref()) {
            slot.bind(t.addr());
        }
        debug!(
            "registered patch {id} of {target:#x} -> {replacement:#x}: {} byte jump, prefix {}",
            redirect.jump.len(),
            prefix.len
        );
        reg.entries.insert(
            target,
            Entry {
                id,
                patch_addr: redirect.patch_addr,
                jump: redirect.jump,
                original,
                trampoline: tramp.map(|t| t.addr()),
                slot: req.slot,
                applied: false,
            },
        );
        Ok(Guard::new(self, target, id))
    }

    fn plan_redirect(&self, target: usize, replacement: usize, code: &[u8]) -> Result<Redirect> {
        let patch_addr = target + HostArch::entry_marker_len(code);
        let jump = HostArch::encode_redirect_jump(patch_addr as u64, replacement as u64);
        if jump.len() <= HostArch::SHORT_JUMP_LEN {
            return Ok(Redirect { patch_addr, jump, relay: None });
        }

        // Far replacement: bounce through a stub within short range of the target.
        if let Some(relay) = self.memory.acquire(RELAY_SIZE, Some((patch_addr, HostArch::NEAR_RANGE as usize)))? {
            let short = HostArch::encode_redirect_jump(patch_addr as u64, relay.addr() as u64);
            if short.len() <= HostArch::SHORT_JUMP_LEN {
                let stub = HostArch::encode_redirect_jump(relay.addr() as u64, replacement as u64);
                debug!("relay for {target:#x} at {:#x}", relay.addr());
                return Ok(Redirect { patch_addr, jump: short, relay: Some((relay, stub)) });
            }
        }
        Ok(Redirect { patch_addr, jump, relay: None })
    }

    /// Whether an applied patch exists for `addr`.
    pub fn is_patched(&self, addr: usize) -> bool {
        self.lock().entries.get(&strip_code_ptr(addr)).is_some_and(|e| e.applied)
    }

    /// Number of registered patches, applied or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Undo and forget the patch of `addr`. `Ok(false)` if nothing was applied.
    pub fn unpatch(&self, addr: usize) -> Result<bool> {
        let addr = strip_code_ptr(addr);
        let mut reg = self.lock();
        let Some(entry) = reg.entries.remove(&addr) else {
            return Ok(false);
        };
        entry.release_slot();
        if !entry.applied {
            return Ok(false);
        }
        // SAFETY: the entry was written over this address by this engine.
        unsafe { self.memory.write_code(entry.patch_addr, &entry.original)? };
        Ok(true)
    }

    /// Undo and forget every patch. Returns how many were applied.
    pub fn teardown(&self) -> usize {
        let mut reg = self.lock();
        let mut restored = 0;
        for (target, entry) in reg.entries.drain() {
            entry.release_slot();
            if !entry.applied {
                continue;
            }
            // SAFETY: as in `unpatch`.
            match unsafe { self.memory.write_code(entry.patch_addr, &entry.original) } {
                Ok(()) => restored += 1,
                Err(e) => log::error!("failed to restore {target:#x} during teardown: {e}"),
            }
        }
        if restored > 0 {
            info!("engine teardown restored {restored} patch(es)");
        }
        restored
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.teardown();
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{host, place};
    use super::*;
    use crate::lock_hook_tests;
    use std::sync::atomic::AtomicUsize;

    fn engine() -> Engine {
        let _ = env_logger::builder().is_test(true).try_init();
        Engine::new(EngineConfig::default().use_placeholder(false).mapping_size(16 * 1024))
    }

    #[test]
    fn scenario_replacement_then_unpatch() {
        let _g = lock_hook_tests();
        let engine = engine();
        let f = place(engine.memory(), &host::mul_const(2));
        let g = place(engine.memory(), &host::mul_const(3));
        unsafe {
            assert_eq!(f.call(1), 2);
            let guard = engine.patch(f.addr(), g.addr()).unwrap();
            assert!(guard.apply().unwrap());
            assert_eq!(f.call(1), 3);
            assert!(guard.unpatch().unwrap());
            assert_eq!(f.call(1), 2);
        }
    }

    #[test]
    fn scenario_replacement_calls_the_trampoline() {
        let _g = lock_hook_tests();
        let engine = engine();
        let double = place(engine.memory(), &host::mul_const(2));

        // The replacement reads the trampoline address from a cell filled in after patching.
        let mem = engine.memory();
        let repl_slot = mem.acquire_any(64).unwrap();
        unsafe {
            let guard = engine
                .patch_request(PatchRequest::new(double.addr(), repl_slot.addr()).with_trampoline())
                .unwrap();
            let tramp = guard.origin_func();
            assert_ne!(tramp, 0);
            mem.write(&repl_slot, &host::call_then_add(tramp as u64, 100)).unwrap();

            guard.apply().unwrap();
            assert_eq!(double.call(1), 102);
            assert_eq!(double.call(-4), 92);
            guard.unpatch().unwrap();
            assert_eq!(double.call(1), 2);
        }
    }

    #[test]
    fn round_trip_restores_exact_bytes() {
        let _g = lock_hook_tests();
        let engine = engine();
        let f = place(engine.memory(), &host::mul_const(2));
        let g = place(engine.memory(), &host::mul_const(3));
        let before = unsafe { engine.memory().raw_read(f.addr(), 16) };
        let guard = unsafe { engine.patch(f.addr(), g.addr()).unwrap() };
        guard.apply().unwrap();
        assert_ne!(unsafe { engine.memory().raw_read(f.addr(), 16) }, before);
        guard.unpatch().unwrap();
        assert_eq!(unsafe { engine.memory().raw_read(f.addr(), 16) }, before);
    }

    #[test]
    fn unpatch_and_restore_are_idempotent() {
        let _g = lock_hook_tests();
        let engine = engine();
        let f = place(engine.memory(), &host::mul_const(2));
        let g = place(engine.memory(), &host::mul_const(3));
        unsafe {
            let guard = engine.patch(f.addr(), g.addr()).unwrap();
            assert!(!guard.unpatch().unwrap(), "nothing applied yet");
            guard.apply().unwrap();
            assert!(!guard.apply().unwrap(), "already applied");
            assert!(guard.unpatch().unwrap());
            assert!(!guard.unpatch().unwrap());
            assert_eq!(f.call(5), 10);

            assert!(guard.restore().unwrap());
            assert_eq!(f.call(5), 15);
            assert!(guard.restore().unwrap(), "restore rewrites the jump");
            assert_eq!(f.call(5), 15);
            assert!(engine.is_patched(f.addr()));
        }
    }

    #[test]
    fn second_patch_supersedes_the_first() {
        let _g = lock_hook_tests();
        let engine = engine();
        let f = place(engine.memory(), &host::mul_const(2));
        let g = place(engine.memory(), &host::mul_const(3));
        let h = place(engine.memory(), &host::mul_const(5));
        unsafe {
            let first = engine.patch_request(PatchRequest::new(f.addr(), g.addr()).with_trampoline()).unwrap();
            first.apply().unwrap();
            let second = engine.patch_request(PatchRequest::new(f.addr(), h.addr()).with_trampoline()).unwrap();
            assert_eq!(engine.len(), 1);
            // Superseding unpatched the first; the second is not applied yet.
            assert_eq!(f.call(1), 2);

            second.apply().unwrap();
            assert_eq!(f.call(1), 5);
            // The new trampoline was built from the pristine bytes.
            let orig: extern "C" fn(i64) -> i64 = core::mem::transmute(second.origin_func());
            assert_eq!(orig(4), 8);

            assert!(matches!(first.apply(), Err(PatchError::AlreadyPatched { .. })));
            assert!(matches!(first.restore(), Err(PatchError::AlreadyPatched { .. })));
            assert!(!first.unpatch().unwrap());
            assert_eq!(first.origin_func(), 0);
            drop(first);
            assert_eq!(f.call(1), 5, "dropping a stale guard leaves the live patch alone");
        }
    }

    #[test]
    fn superseding_an_applied_patch_on_the_same_bytes() {
        let _g = lock_hook_tests();
        let engine = engine();
        let f = place(engine.memory(), &host::mul_const(2));
        let g = place(engine.memory(), &host::mul_const(3));
        unsafe {
            let first = engine.patch(f.addr(), g.addr()).unwrap();
            first.apply().unwrap();
            let second = engine.patch(f.addr(), g.addr()).unwrap();
            second.apply().unwrap();
            drop(first);
            assert_eq!(f.call(2), 6);
            drop(second);
            assert_eq!(f.call(2), 4);
            assert!(engine.is_empty());
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn failed_restore_of_the_prior_patch_keeps_it_registered() {
        let _g = lock_hook_tests();
        let engine = engine();
        let f = place(engine.memory(), &host::mul_const(2));
        let g = place(engine.memory(), &host::mul_const(3));

        // An applied entry whose bytes live past the end of user space: restoring it
        // fails in mprotect with nothing written.
        let unmapped = 1usize << 52;
        engine.lock().entries.insert(
            f.addr(),
            Entry {
                id: 999,
                patch_addr: unmapped,
                jump: vec![0; 4],
                original: vec![0; 4],
                trampoline: None,
                slot: None,
                applied: true,
            },
        );

        let err = unsafe { engine.patch(f.addr(), g.addr()).unwrap_err() };
        assert!(matches!(err, PatchError::Protection { .. }), "{err:?}");
        {
            let reg = engine.lock();
            let prior = reg.entries.get(&f.addr()).expect("prior entry survives");
            assert_eq!(prior.id, 999);
            assert!(prior.applied);
        }
        assert!(engine.is_patched(f.addr()));
        assert_eq!(unsafe { f.call(1) }, 2);

        engine.lock().entries.remove(&f.addr());
    }

    #[test]
    fn guard_drop_unpatches() {
        let _g = lock_hook_tests();
        let engine = engine();
        let f = place(engine.memory(), &host::mul_const(2));
        let g = place(engine.memory(), &host::mul_const(3));
        unsafe {
            {
                let guard = engine.patch(f.addr(), g.addr()).unwrap();
                guard.apply().unwrap();
                assert_eq!(f.call(1), 3);
            }
            assert_eq!(f.call(1), 2);
            assert!(engine.is_empty());
        }
    }

    #[test]
    fn engine_unpatch_by_address_and_teardown() {
        let _g = lock_hook_tests();
        let engine = engine();
        let f = place(engine.memory(), &host::mul_const(2));
        let k = place(engine.memory(), &host::mul_const(7));
        let g = place(engine.memory(), &host::mul_const(3));
        unsafe {
            let gf = engine.patch(f.addr(), g.addr()).unwrap();
            let gk = engine.patch(k.addr(), g.addr()).unwrap();
            gf.apply().unwrap();
            gk.apply().unwrap();
            assert!(engine.unpatch(f.addr()).unwrap());
            assert!(!engine.unpatch(f.addr()).unwrap());
            assert_eq!(f.call(1), 2);
            assert!(!gf.unpatch().unwrap());

            assert_eq!(engine.teardown(), 1);
            assert_eq!(k.call(1), 7);
            assert!(engine.is_empty());
            assert!(!gk.restore().unwrap());
        }
    }

    struct CountingSlot {
        addr: AtomicUsize,
        cap: Option<usize>,
    }

    impl TrampolineSlot for CountingSlot {
        fn capacity(&self) -> Option<usize> {
            self.cap
        }
        fn bind(&self, addr: usize) {
            self.addr.store(addr, Ordering::SeqCst);
        }
        fn clear(&self) {
            self.addr.store(0, Ordering::SeqCst);
        }
    }

    #[test]
    fn slot_is_bound_and_cleared() {
        static SLOT: CountingSlot = CountingSlot { addr: AtomicUsize::new(0), cap: None };
        let _g = lock_hook_tests();
        let engine = engine();
        let f = place(engine.memory(), &host::mul_const(2));
        let g = place(engine.memory(), &host::mul_const(3));
        unsafe {
            let guard = engine.patch_request(PatchRequest::new(f.addr(), g.addr()).slot(&SLOT)).unwrap();
            let bound = SLOT.addr.load(Ordering::SeqCst);
            assert_eq!(bound, guard.origin_func());
            let orig: extern "C" fn(i64) -> i64 = core::mem::transmute(bound);
            guard.apply().unwrap();
            assert_eq!(orig(21), 42);
            drop(guard);
            assert_eq!(SLOT.addr.load(Ordering::SeqCst), 0);
        }
    }

    #[test]
    fn small_slot_capacity_overflows() {
        static TINY: CountingSlot = CountingSlot { addr: AtomicUsize::new(0), cap: Some(4) };
        let _g = lock_hook_tests();
        let engine = engine();
        let f = place(engine.memory(), &host::mul_const(2));
        let g = place(engine.memory(), &host::mul_const(3));
        let err = unsafe { engine.patch_request(PatchRequest::new(f.addr(), g.addr()).slot(&TINY)).unwrap_err() };
        assert!(matches!(err, PatchError::SpaceOverflow { available: 4, .. }));
        assert!(engine.is_empty());
    }

    #[test]
    fn too_short_target_is_rejected_before_any_write() {
        let _g = lock_hook_tests();
        let engine = engine();
        #[cfg(target_arch = "x86_64")]
        let tiny = place(engine.memory(), &[0xC3, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]);
        #[cfg(target_arch = "aarch64")]
        let tiny = place(engine.memory(), &[0xC0, 0x03, 0x5F, 0xD6, 0, 0, 0x20, 0xD4]);
        let g = place(engine.memory(), &host::mul_const(3));
        let before = unsafe { engine.memory().raw_read(tiny.addr(), 8) };
        let err = unsafe { engine.patch(tiny.addr(), g.addr()).unwrap_err() };
        assert!(matches!(err, PatchError::FunctionTooShort { .. }), "{err}");
        assert_eq!(unsafe { engine.memory().raw_read(tiny.addr(), 8) }, before);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn far_replacement_goes_through_a_relay() {
        let _g = lock_hook_tests();
        let engine = engine();
        let f = place(engine.memory(), &host::mul_const(2));
        // A replacement mapped far away from the target.
        let far_mem = ExecutableMemory::new(4096, false);
        let origin = f.addr();
        let far_slot = match far_mem.acquire(64, Some((origin ^ (1 << 40), 1 << 30))) {
            Ok(Some(slot)) if slot.addr().abs_diff(origin) > 1 << 32 => slot,
            _ => return,
        };
        far_mem.write(&far_slot, &host::mul_const(3)).unwrap();
        unsafe {
            let guard = engine.patch(f.addr(), far_slot.addr()).unwrap();
            guard.apply().unwrap();
            let head = engine.memory().raw_read(f.addr(), 5);
            assert_eq!(head[0], 0xE9, "short jump to the relay");
            assert_eq!(f.call(2), 6);
        }
    }

    #[test]
    fn concurrent_callers_while_patching() {
        let _g = lock_hook_tests();
        let engine = engine();
        let f_code = host::mul_const(2);
        let g_code = host::mul_const(3);
        // Target and replacement share one page; a leading aligned pad keeps the
        // redirect inside a single 8-byte word so callers never see a torn jump.
        let page = engine.memory().acquire_any(256).unwrap();
        let mut image = vec![0u8; 192];
        #[cfg(target_arch = "x86_64")]
        let pad: &[u8] = &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00];
        #[cfg(target_arch = "aarch64")]
        let pad: &[u8] = &[0x1F, 0x20, 0x03, 0xD5, 0x1F, 0x20, 0x03, 0xD5];
        image[..8].copy_from_slice(pad);
        image[8..8 + f_code.len()].copy_from_slice(&f_code);
        image[128..128 + g_code.len()].copy_from_slice(&g_code);
        engine.memory().write(&page, &image).unwrap();
        let target = page.addr();
        let replacement = page.addr() + 128;
        let call = |x: i64| unsafe {
            let f: extern "C" fn(i64) -> i64 = core::mem::transmute(target);
            std::hint::black_box(f)(x)
        };

        let stop = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while !stop.load(Ordering::Relaxed) {
                        let v = call(1);
                        assert!(v == 2 || v == 3, "unexpected {v}");
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..200 {
                    let guard = unsafe { engine.patch(target, replacement).unwrap() };
                    guard.apply().unwrap();
                    guard.unpatch().unwrap();
                    guard.restore().unwrap();
                }
                stop.store(true, Ordering::Relaxed);
            });
        });
        assert!(engine.len() <= 1);

        // Many threads racing to patch the same target leave one entry.
        std::thread::scope(|s| {
            let guards: Vec<_> = (0..8)
                .map(|_| s.spawn(|| unsafe { engine.patch(target, replacement).unwrap() }))
                .collect();
            let guards: Vec<_> = guards.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(engine.len(), 1);
            assert_eq!(guards.iter().filter(|g| g.is_current()).count(), 1);
        });
        assert_eq!(call(1), 2);
        assert!(engine.is_empty());
    }
}
