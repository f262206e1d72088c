//! Layout-level descriptions of function pointer types.
//!
//! Two signatures are compatible when they pass the same number of
//! arguments with matching storage sizes and agree on the return value.
//! Nominal types are never compared.

use hotswap_intercept::PatchError;
use std::fmt::Write as _;
use std::mem::{align_of, size_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub size: usize,
    pub align: usize,
}

impl Layout {
    pub const fn of<T>() -> Self {
        Self { size: size_of::<T>(), align: align_of::<T>() }
    }
}

/// A function pointer type whose argument and return layouts are known.
pub trait FnSignature: Copy + Send + Sync + 'static {
    fn args() -> Vec<Layout>;

    /// `None` for functions returning a zero-sized value.
    fn ret() -> Option<Layout>;

    fn addr(self) -> usize;

    /// # Safety
    /// `addr` must be the entry point of a function with this signature.
    unsafe fn from_addr(addr: usize) -> Self;

    /// Short layout description, e.g. `fn(8, 4) -> 8`.
    fn describe() -> String {
        let mut s = String::from("fn(");
        for (i, arg) in Self::args().iter().enumerate() {
            if i > 0 {
                s.push_str(", ");
            }
            let _ = write!(s, "{}", arg.size);
        }
        s.push(')');
        if let Some(ret) = Self::ret() {
            let _ = write!(s, " -> {}", ret.size);
        }
        s
    }
}

fn ret_layout<R>() -> Option<Layout> {
    (size_of::<R>() > 0).then(Layout::of::<R>)
}

macro_rules! impl_fn_signature {
    (@one $ty:ty; $($arg:ident),*) => {
        impl<R: 'static, $($arg: 'static),*> FnSignature for $ty {
            fn args() -> Vec<Layout> {
                vec![$(Layout::of::<$arg>()),*]
            }

            fn ret() -> Option<Layout> {
                ret_layout::<R>()
            }

            fn addr(self) -> usize {
                self as usize
            }

            unsafe fn from_addr(addr: usize) -> Self {
                std::mem::transmute_copy::<usize, Self>(&addr)
            }
        }
    };
    ($($arg:ident),*) => {
        impl_fn_signature!(@one fn($($arg),*) -> R; $($arg),*);
        impl_fn_signature!(@one unsafe fn($($arg),*) -> R; $($arg),*);
        impl_fn_signature!(@one extern "C" fn($($arg),*) -> R; $($arg),*);
        impl_fn_signature!(@one unsafe extern "C" fn($($arg),*) -> R; $($arg),*);
    };
}

impl_fn_signature!();
impl_fn_signature!(A1);
impl_fn_signature!(A1, A2);
impl_fn_signature!(A1, A2, A3);
impl_fn_signature!(A1, A2, A3, A4);
impl_fn_signature!(A1, A2, A3, A4, A5);
impl_fn_signature!(A1, A2, A3, A4, A5, A6);
impl_fn_signature!(A1, A2, A3, A4, A5, A6, A7);
impl_fn_signature!(A1, A2, A3, A4, A5, A6, A7, A8);

/// Check that `G` can stand in for `T` at the machine level.
pub fn check_compatible<T: FnSignature, G: FnSignature>() -> Result<(), PatchError> {
    let (want, got) = (T::args(), G::args());
    let args_match = want.len() == got.len() && want.iter().zip(&got).all(|(a, b)| a.size == b.size);
    let ret_match = match (T::ret(), G::ret()) {
        (None, None) => true,
        (Some(a), Some(b)) => a.size == b.size,
        _ => false,
    };
    if args_match && ret_match {
        Ok(())
    } else {
        Err(PatchError::SignatureMismatch { expected: T::describe(), found: G::describe() })
    }
}
