use crate::engine::Engine;
use crate::error::{PatchError, Result};
use log::{debug, error};

/// Handle to one registered patch.
///
/// A guard stays bound to the registration that created it. Once a newer
/// patch of the same target supersedes it, `apply` and `restore` fail with
/// [`PatchError::AlreadyPatched`] and `unpatch` does nothing. Dropping the
/// current guard unpatches and forgets the target.
#[must_use = "dropping a guard removes its patch"]
pub struct Guard<'e> {
    engine: &'e Engine,
    target: usize,
    id: u64,
}

impl std::fmt::Debug for Guard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("target", &format_args!("{:#x}", self.target))
            .field("id", &self.id)
            .finish()
    }
}

impl<'e> Guard<'e> {
    pub(crate) fn new(engine: &'e Engine, target: usize, id: u64) -> Self {
        Self { engine, target, id }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Write the redirect. `Ok(false)` if it is already in place or the
    /// patch was removed through the engine.
    pub fn apply(&self) -> Result<bool> {
        let mut reg = self.engine.lock();
        let Some(entry) = reg.entries.get_mut(&self.target) else {
            return Ok(false);
        };
        if entry.id != self.id {
            return Err(PatchError::AlreadyPatched { target: self.target });
        }
        if entry.applied {
            return Ok(false);
        }
        // SAFETY: the entry was planned against this address's code.
        unsafe { self.engine.memory().write_code(entry.patch_addr, &entry.jump)? };
        entry.applied = true;
        debug!("applied patch {} at {:#x}", self.id, self.target);
        Ok(true)
    }

    /// Put the original bytes back. `Ok(false)` if nothing was applied.
    pub fn unpatch(&self) -> Result<bool> {
        let mut reg = self.engine.lock();
        let Some(entry) = reg.entries.get_mut(&self.target).filter(|e| e.id == self.id) else {
            return Ok(false);
        };
        if !entry.applied {
            return Ok(false);
        }
        // SAFETY: as in `apply`.
        unsafe { self.engine.memory().write_code(entry.patch_addr, &entry.original)? };
        entry.applied = false;
        debug!("unpatched {} at {:#x}", self.id, self.target);
        Ok(true)
    }

    /// Write the redirect again, whether or not it is currently applied.
    pub fn restore(&self) -> Result<bool> {
        let mut reg = self.engine.lock();
        let Some(entry) = reg.entries.get_mut(&self.target) else {
            return Ok(false);
        };
        if entry.id != self.id {
            return Err(PatchError::AlreadyPatched { target: self.target });
        }
        // SAFETY: as in `apply`.
        unsafe { self.engine.memory().write_code(entry.patch_addr, &entry.jump)? };
        entry.applied = true;
        Ok(true)
    }

    /// Address of the trampoline that runs the original behavior, or 0 when
    /// none was built or this guard is no longer current.
    pub fn origin_func(&self) -> usize {
        let reg = self.engine.lock();
        reg.entries
            .get(&self.target)
            .filter(|e| e.id == self.id)
            .and_then(|e| e.trampoline)
            .unwrap_or(0)
    }

    pub fn is_applied(&self) -> bool {
        let reg = self.engine.lock();
        reg.entries.get(&self.target).is_some_and(|e| e.id == self.id && e.applied)
    }

    /// Whether this guard still owns the target's registration.
    pub fn is_current(&self) -> bool {
        let reg = self.engine.lock();
        reg.entries.get(&self.target).is_some_and(|e| e.id == self.id)
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        let mut reg = self.engine.lock();
        if !reg.entries.get(&self.target).is_some_and(|e| e.id == self.id) {
            return;
        }
        let Some(entry) = reg.entries.remove(&self.target) else {
            return;
        };
        entry.release_slot();
        if entry.applied {
            // SAFETY: as in `apply`.
            if let Err(e) = unsafe { self.engine.memory().write_code(entry.patch_addr, &entry.original) } {
                error!("failed to unpatch {:#x} on drop: {e}", self.target);
            }
        }
    }
}
