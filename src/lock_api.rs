//! Implementations of [`lock_api`](https://crates.io/crates/lock_api) locking traits.

use super::lock::Lock;

/// Mutual exclusion over data of type `T`, backed by [`Lock`].
pub(crate) type Mutex<T> = lock_api::Mutex<Lock, T>;

/// An RAII guard of a [`Mutex`].
pub(crate) type MutexGuard<'a, T> = lock_api::MutexGuard<'a, Lock, T>;

/// Reader-writer lock over data of type `T`, backed by [`Lock`].
pub(crate) type RwLock<T> = lock_api::RwLock<Lock, T>;

unsafe impl lock_api::RawMutex for Lock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Lock::new();

    type GuardMarker = lock_api::GuardSend;

    #[inline]
    fn lock(&self) {
        self.lock_exclusive();
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.try_lock_exclusive()
    }

    #[inline]
    unsafe fn unlock(&self) {
        let released = self.release_exclusive();
        debug_assert!(released);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        Lock::is_locked(self) || self.is_shared()
    }
}

unsafe impl lock_api::RawRwLock for Lock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Lock::new();

    type GuardMarker = lock_api::GuardSend;

    #[inline]
    fn lock_shared(&self) {
        Lock::lock_shared(self);
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        Lock::try_lock_shared(self)
    }

    #[inline]
    unsafe fn unlock_shared(&self) {
        let released = self.release_shared();
        debug_assert!(released);
    }

    #[inline]
    fn lock_exclusive(&self) {
        Lock::lock_exclusive(self);
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        Lock::try_lock_exclusive(self)
    }

    #[inline]
    unsafe fn unlock_exclusive(&self) {
        let released = self.release_exclusive();
        debug_assert!(released);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        Lock::is_locked(self) || self.is_shared()
    }

    #[inline]
    fn is_locked_exclusive(&self) -> bool {
        Lock::is_locked(self)
    }
}
