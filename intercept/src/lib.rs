//! hotswap-intercept: the runtime patching engine behind `hotswap`.
//!
//! Decodes machine code, writes redirect jumps over function entries,
//! relocates displaced prologues into trampolines and swaps trait-object
//! tables. Everything here works on raw addresses; the typed surface lives
//! in the `hotswap` crate.

pub mod arch;
pub mod code;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod relocate;
pub mod trampoline;
pub mod view;
pub mod vtable;

pub use config::EngineConfig;
pub use engine::{Engine, PatchRequest, TrampolineSlot};
pub use error::{DecodeError, PatchError, RelocationError, Result};
pub use guard::Guard;
pub use vtable::VtableInterceptor;

/// Process-global lock for tests that execute code while it is being rewritten.
///
/// Patching tests share the placeholder region and run real calls through
/// patched fixtures, so they hold this lock to stay serialized.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
