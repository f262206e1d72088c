//! Raw views onto two-word representations and foreign memory.
//!
//! Every reinterpretation of a fat pointer or of code bytes as plain data
//! goes through here.

use crate::error::{PatchError, Result};
use core::mem::size_of;

/// Two adjacent machine words, such as the `{data, vtable}` of a `&dyn T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordPair {
    pub first: usize,
    pub second: usize,
}

impl WordPair {
    /// # Safety
    /// `ptr` must be valid for reading two words.
    pub unsafe fn load(ptr: *const usize) -> Self {
        Self { first: ptr.read_volatile(), second: ptr.add(1).read_volatile() }
    }

    /// # Safety
    /// `ptr` must be valid for writing two words.
    pub unsafe fn store(self, ptr: *mut usize) {
        ptr.write_volatile(self.first);
        ptr.add(1).write_volatile(self.second);
    }
}

/// A memory location holding a `&dyn T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynSlot {
    addr: *mut usize,
}

unsafe impl Send for DynSlot {}

impl DynSlot {
    /// Fails unless `&T` is a two-word fat reference.
    ///
    /// # Safety
    /// `var` must be valid for reads and writes for as long as the slot is used.
    pub unsafe fn new<T: ?Sized>(var: *mut &T) -> Result<Self> {
        let size = size_of::<&T>();
        if size != 2 * size_of::<usize>() {
            return Err(PatchError::NotATraitObject { size });
        }
        Ok(Self { addr: var as *mut usize })
    }

    pub fn addr(&self) -> usize {
        self.addr as usize
    }

    /// Current `{data, table}` words.
    ///
    /// # Safety
    /// The slot must still be valid.
    pub unsafe fn read(&self) -> WordPair {
        WordPair::load(self.addr)
    }

    /// # Safety
    /// `pair` must form a valid `&dyn T` for the slot's type, or nothing must
    /// call through the slot until it is restored.
    pub unsafe fn write(&self, pair: WordPair) {
        pair.store(self.addr)
    }

    pub fn data(pair: &WordPair) -> usize {
        pair.first
    }

    pub fn table(pair: &WordPair) -> usize {
        pair.second
    }
}

/// Copy `len` bytes out of arbitrary readable memory.
///
/// # Safety
/// `addr..addr + len` must be readable.
pub unsafe fn copy_out(addr: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    core::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), len);
    out
}

/// Read `count` words starting at `addr`.
///
/// # Safety
/// `addr` must be word aligned and readable for `count` words.
pub unsafe fn copy_words(addr: usize, count: usize) -> Vec<usize> {
    let base = addr as *const usize;
    (0..count).map(|i| base.add(i).read()).collect()
}
