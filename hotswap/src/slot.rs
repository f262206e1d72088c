use crate::signature::FnSignature;
use hotswap_intercept::TrampolineSlot;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A typed variable that the engine points at a trampoline.
///
/// Declare it as a `static` next to the replacement so the replacement can
/// call the original behavior:
///
/// ```ignore
/// static ORIGINAL: Trampoline<fn(i64) -> i64> = Trampoline::new();
/// ```
pub struct Trampoline<F: FnSignature> {
    addr: AtomicUsize,
    capacity: Option<usize>,
    _sig: PhantomData<F>,
}

impl<F: FnSignature> Trampoline<F> {
    pub const fn new() -> Self {
        Self { addr: AtomicUsize::new(0), capacity: None, _sig: PhantomData }
    }

    /// A slot whose trampoline must fit in `bytes`.
    pub const fn with_capacity(bytes: usize) -> Self {
        Self { addr: AtomicUsize::new(0), capacity: Some(bytes), _sig: PhantomData }
    }

    /// The bound trampoline, if a patch currently provides one.
    pub fn get(&self) -> Option<F> {
        if std::mem::size_of::<F>() != std::mem::size_of::<usize>() {
            return None;
        }
        match self.addr.load(Ordering::Acquire) {
            0 => None,
            // SAFETY: the engine only binds trampolines built for a target of type `F`.
            addr => Some(unsafe { F::from_addr(addr) }),
        }
    }

    pub fn addr(&self) -> usize {
        self.addr.load(Ordering::Acquire)
    }

    pub fn is_bound(&self) -> bool {
        self.addr() != 0
    }
}

impl<F: FnSignature> Default for Trampoline<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: FnSignature> std::fmt::Debug for Trampoline<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trampoline")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<F: FnSignature> TrampolineSlot for Trampoline<F> {
    fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn bind(&self, addr: usize) {
        self.addr.store(addr, Ordering::Release);
    }

    fn clear(&self) {
        self.addr.store(0, Ordering::Release);
    }
}
