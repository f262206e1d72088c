//! Interception of calls made through a `&dyn Trait` variable.
//!
//! The variable's `{data, table}` pair is swapped for a context block and a
//! synthetic table. Intercepted slots point at stubs that load the context
//! into the receiver register and jump to a handler; every other slot traps.

use crate::arch::{Arch, HostArch};
use crate::code::ptrauth::strip_code_ptr;
use crate::engine::Engine;
use crate::error::{PatchError, Result};
use crate::view::{copy_words, DynSlot, WordPair};
use log::{debug, error};
use std::marker::PhantomData;

/// `drop_in_place`, `size` and `align` precede the methods in a trait object's table.
pub const VTABLE_HEADER_WORDS: usize = 3;

extern "C" fn not_implemented() -> ! {
    error!("called a method that has no interception handler");
    std::process::abort()
}

/// Address every unhandled slot of a synthetic table holds.
pub fn trap_entry() -> usize {
    not_implemented as *const () as usize
}

pub struct VtableInterceptor<'a, T: ?Sized> {
    engine: &'a Engine,
    slot: DynSlot,
    methods: usize,
    context: usize,
    table: Box<[usize]>,
    backup: Option<WordPair>,
    _var: PhantomData<*mut &'a T>,
}

impl<'a, T: ?Sized> VtableInterceptor<'a, T> {
    /// Prepare to intercept calls through `var`, whose trait has `methods`
    /// methods. Handlers receive `context` in place of the receiver.
    ///
    /// # Safety
    /// `var` must stay valid while the interceptor lives and must only be
    /// read with volatile loads while calls are intercepted.
    pub unsafe fn new<C>(engine: &'a Engine, var: *mut &'a T, methods: usize, context: &'a C) -> Result<Self> {
        let slot = DynSlot::new(var)?;
        let current = slot.read();
        let mut table = vec![trap_entry(); VTABLE_HEADER_WORDS + methods];
        table[..VTABLE_HEADER_WORDS].copy_from_slice(&copy_words(DynSlot::table(&current), VTABLE_HEADER_WORDS));
        Ok(Self {
            engine,
            slot,
            methods,
            context: context as *const C as usize,
            table: table.into_boxed_slice(),
            backup: None,
            _var: PhantomData,
        })
    }

    /// Route calls of method `index` to `handler`.
    ///
    /// # Safety
    /// `handler` must be an `extern "C" fn(&C, args..) -> R` whose arguments
    /// and result match the trait method's.
    pub unsafe fn intercept(&mut self, index: usize, handler: usize) -> Result<()> {
        if index >= self.methods {
            return Err(PatchError::MethodIndexOutOfRange { index, methods: self.methods });
        }
        let sizing = HostArch::encode_context_stub(0, self.context as u64, strip_code_ptr(handler) as u64);
        let stub_slot = self.engine.memory().acquire_any(sizing.len())?;
        let stub = HostArch::encode_context_stub(
            stub_slot.addr() as u64,
            self.context as u64,
            strip_code_ptr(handler) as u64,
        );
        self.engine.memory().write(&stub_slot, &stub)?;
        self.table[VTABLE_HEADER_WORDS + index] = stub_slot.addr();
        debug!("method {index} of {:#x} -> stub {:#x}", self.slot.addr(), stub_slot.addr());

        if self.backup.is_none() {
            self.backup = Some(self.slot.read());
            self.slot.write(WordPair { first: self.context, second: self.table.as_ptr() as usize });
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.backup.is_some()
    }

    /// Current entry of method `index` in the synthetic table.
    pub fn method_entry(&self, index: usize) -> Option<usize> {
        self.table.get(VTABLE_HEADER_WORDS + index).copied()
    }

    /// Put the original `{data, table}` pair back. `false` if nothing was swapped.
    pub fn cancel(&mut self) -> bool {
        let Some(backup) = self.backup.take() else {
            return false;
        };
        // SAFETY: the pair was read from this slot, which outlives `self`.
        unsafe { self.slot.write(backup) };
        debug!("restored {:#x}", self.slot.addr());
        true
    }
}

impl<T: ?Sized> Drop for VtableInterceptor<'_, T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::ptr;

    trait Shape {
        fn area(&self, scale: i64) -> i64;
        fn sides(&self) -> i64;
    }

    struct Square(i64);

    impl Shape for Square {
        fn area(&self, scale: i64) -> i64 {
            self.0 * self.0 * scale
        }
        fn sides(&self) -> i64 {
            4
        }
    }

    struct Recorder {
        bonus: i64,
    }

    extern "C" fn fake_area(ctx: &Recorder, scale: i64) -> i64 {
        ctx.bonus + scale
    }

    extern "C" fn fake_sides(ctx: &Recorder) -> i64 {
        -ctx.bonus
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig::default().use_placeholder(false).mapping_size(4096))
    }

    #[test]
    fn intercepted_method_sees_the_context() {
        let engine = engine();
        let square = Square(3);
        let ctx = Recorder { bonus: 1000 };
        let mut var: &dyn Shape = &square;
        let call_area = |v: &&dyn Shape| unsafe { ptr::read_volatile(v) }.area(2);
        assert_eq!(call_area(&var), 18);

        unsafe {
            let mut icpt = VtableInterceptor::new(&engine, ptr::addr_of_mut!(var), 2, &ctx).unwrap();
            icpt.intercept(0, fake_area as *const () as usize).unwrap();
            assert!(icpt.is_active());
            assert_eq!(icpt.method_entry(1), Some(trap_entry()));
            assert_eq!(call_area(&*ptr::addr_of!(var)), 1002);

            icpt.intercept(1, fake_sides as *const () as usize).unwrap();
            assert_eq!(ptr::read_volatile(ptr::addr_of!(var)).sides(), -1000);

            assert!(icpt.cancel());
            assert!(!icpt.cancel());
        }
        assert_eq!(call_area(&var), 18);
        assert_eq!(var.sides(), 4);
    }

    #[test]
    fn drop_restores_the_original_pair() {
        let engine = engine();
        let square = Square(2);
        let ctx = Recorder { bonus: 7 };
        let mut var: &dyn Shape = &square;
        let before = unsafe { WordPair::load(ptr::addr_of!(var) as *const usize) };
        unsafe {
            let mut icpt = VtableInterceptor::new(&engine, ptr::addr_of_mut!(var), 2, &ctx).unwrap();
            icpt.intercept(1, fake_sides as *const () as usize).unwrap();
            let swapped = WordPair::load(ptr::addr_of!(var) as *const usize);
            assert_eq!(swapped.first, &ctx as *const Recorder as usize);
            assert_ne!(swapped.second, before.second);
        }
        let after = unsafe { WordPair::load(ptr::addr_of!(var) as *const usize) };
        assert_eq!(after, before);
        assert_eq!(var.area(1), 4);
    }

    #[test]
    fn synthetic_table_keeps_the_header_and_traps_the_rest() {
        let engine = engine();
        let square = Square(1);
        let ctx = Recorder { bonus: 0 };
        let mut var: &dyn Shape = &square;
        let original = unsafe { WordPair::load(ptr::addr_of!(var) as *const usize) };
        let header = unsafe { copy_words(original.second, VTABLE_HEADER_WORDS) };
        let mut icpt = unsafe { VtableInterceptor::new(&engine, ptr::addr_of_mut!(var), 2, &ctx).unwrap() };
        assert!(!icpt.is_active());
        assert_eq!(&icpt.table[..VTABLE_HEADER_WORDS], &header[..]);
        assert_eq!(icpt.table[1], std::mem::size_of::<Square>());
        assert_eq!(icpt.method_entry(0), Some(trap_entry()));
        assert_eq!(icpt.method_entry(2), None);

        let err = unsafe { icpt.intercept(2, fake_area as *const () as usize).unwrap_err() };
        assert!(matches!(err, PatchError::MethodIndexOutOfRange { index: 2, methods: 2 }));
        assert!(!icpt.is_active());
    }
}
