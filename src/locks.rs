//! Locks used by the spaces.
//!
//! The allocator guard of every alloc space is a plain `parking_lot` mutex. The process-wide
//! mutator lock is a reader/writer lock: exclusive hold means the world is stopped, shared
//! hold means mutators may run alongside the holder. Operations that establish the live set
//! from an image ask for a guard of this lock as proof that the caller holds it.

pub use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use once_cell::sync::Lazy;

static MUTATOR_LOCK: Lazy<MutatorLock> = Lazy::new(MutatorLock::new);

/// The global mutator lock.
pub fn mutator_lock() -> &'static MutatorLock {
    &MUTATOR_LOCK
}

pub struct MutatorLock {
    lock: RwLock<()>,
}

impl MutatorLock {
    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
        }
    }

    /// Acquire the lock shared. Blocks while the world is stopped.
    pub fn shared(&self) -> SharedMutatorGuard<'_> {
        SharedMutatorGuard {
            owner: self,
            _guard: self.lock.read(),
        }
    }

    /// Acquire the lock exclusively, stopping the world until the guard is dropped.
    pub fn exclusive(&self) -> ExclusiveMutatorGuard<'_> {
        ExclusiveMutatorGuard {
            owner: self,
            _guard: self.lock.write(),
        }
    }

    pub fn is_held(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn is_exclusive_held(&self) -> bool {
        self.lock.is_locked_exclusive()
    }
}

impl Default for MutatorLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that the mutator lock is held at least shared.
pub trait MutatorAccess {
    fn mutator_lock(&self) -> &MutatorLock;

    fn assert_shared_held(&self) {
        assert!(
            self.mutator_lock().is_held(),
            "mutator lock must be held at least shared"
        );
    }
}

pub struct SharedMutatorGuard<'a> {
    owner: &'a MutatorLock,
    _guard: RwLockReadGuard<'a, ()>,
}

impl MutatorAccess for SharedMutatorGuard<'_> {
    fn mutator_lock(&self) -> &MutatorLock {
        self.owner
    }
}

pub struct ExclusiveMutatorGuard<'a> {
    owner: &'a MutatorLock,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl MutatorAccess for ExclusiveMutatorGuard<'_> {
    fn mutator_lock(&self) -> &MutatorLock {
        self.owner
    }

    fn assert_shared_held(&self) {
        assert!(self.owner.is_exclusive_held());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_shared_holders_coexist() {
        let lock = MutatorLock::new();
        let a = lock.shared();
        let b = lock.shared();
        a.assert_shared_held();
        b.assert_shared_held();
        assert!(lock.is_held());
        assert!(!lock.is_exclusive_held());
        drop(a);
        drop(b);
        assert!(!lock.is_held());
    }

    #[test]
    fn test_exclusive_counts_as_shared() {
        let lock = MutatorLock::new();
        let guard = lock.exclusive();
        guard.assert_shared_held();
        assert!(lock.is_exclusive_held());
    }

    #[test]
    fn test_exclusive_waits_for_shared() {
        let lock = Arc::new(MutatorLock::new());
        let shared = lock.shared();
        let cloned = lock.clone();
        let handle = std::thread::spawn(move || {
            let _world_stopped = cloned.exclusive();
            cloned.is_exclusive_held()
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!lock.is_exclusive_held());
        drop(shared);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_global_lock() {
        let guard = mutator_lock().shared();
        assert!(std::ptr::eq(guard.mutator_lock(), mutator_lock()));
    }
}
