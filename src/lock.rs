//! [`Lock`] is a word-sized spinning reader-writer lock guarding buckets, lock states, and tasks.

#![deny(unsafe_code)]

use std::fmt;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::AtomicUsize;

#[cfg(feature = "loom")]
use loom::sync::atomic::AtomicUsize;

use crate::config::backoff;

/// [`Lock`] is a word-sized spinning reader-writer lock.
///
/// Sections guarded by a [`Lock`] never block, so contenders spin with backoff instead of parking;
/// [`Lock`] is only used through the [`lock_api`](crate::lock_api) aliases.
#[derive(Default)]
pub(crate) struct Lock {
    /// [`Lock`] state: [`Lock::EXCLUSIVE`] or the number of shared owners.
    #[cfg(not(feature = "loom"))]
    state: AtomicUsize,
    /// Loom atomics cannot be built in a constant context; the state is created on first use.
    #[cfg(feature = "loom")]
    state: std::sync::OnceLock<AtomicUsize>,
}

impl Lock {
    /// Maximum number of shared owners.
    pub(crate) const MAX_SHARED_OWNERS: usize = usize::MAX - 1;

    /// State of an exclusively owned lock.
    const EXCLUSIVE: usize = usize::MAX;

    /// Creates a new unlocked [`Lock`].
    #[cfg(not(feature = "loom"))]
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
        }
    }

    /// Creates a new unlocked [`Lock`].
    #[cfg(feature = "loom")]
    pub(crate) const fn new() -> Self {
        Self {
            state: std::sync::OnceLock::new(),
        }
    }

    #[cfg(not(feature = "loom"))]
    #[inline]
    fn state(&self) -> &AtomicUsize {
        &self.state
    }

    #[cfg(feature = "loom")]
    #[inline]
    fn state(&self) -> &AtomicUsize {
        self.state.get_or_init(|| AtomicUsize::new(0))
    }

    /// Returns `true` if the lock is exclusively owned.
    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.state().load(Relaxed) == Self::EXCLUSIVE
    }

    /// Returns `true` if the lock is held by at least one shared owner.
    #[inline]
    pub(crate) fn is_shared(&self) -> bool {
        let state = self.state().load(Relaxed);
        state != 0 && state != Self::EXCLUSIVE
    }

    /// Acquires the lock exclusively.
    #[inline]
    pub(crate) fn lock_exclusive(&self) {
        let mut spin_count = 0;
        loop {
            if self.state().load(Relaxed) == 0 && self.try_lock_exclusive() {
                return;
            }
            spin_count += 1;
            backoff(spin_count);
        }
    }

    /// Tries to acquire the lock exclusively.
    #[inline]
    pub(crate) fn try_lock_exclusive(&self) -> bool {
        self.state()
            .compare_exchange(0, Self::EXCLUSIVE, Acquire, Relaxed)
            .is_ok()
    }

    /// Acquires a shared lock.
    #[inline]
    pub(crate) fn lock_shared(&self) {
        let mut spin_count = 0;
        while !self.try_lock_shared() {
            spin_count += 1;
            backoff(spin_count);
        }
    }

    /// Tries to acquire a shared lock.
    #[inline]
    pub(crate) fn try_lock_shared(&self) -> bool {
        self.state()
            .fetch_update(Acquire, Relaxed, |state| {
                (state < Self::MAX_SHARED_OWNERS).then_some(state + 1)
            })
            .is_ok()
    }

    /// Releases an exclusive lock.
    ///
    /// Returns `false` if the lock was not exclusively owned.
    #[inline]
    pub(crate) fn release_exclusive(&self) -> bool {
        self.state()
            .compare_exchange(Self::EXCLUSIVE, 0, Release, Relaxed)
            .is_ok()
    }

    /// Releases a shared lock.
    ///
    /// Returns `false` if the lock was not shared.
    #[inline]
    pub(crate) fn release_shared(&self) -> bool {
        self.state()
            .fetch_update(Release, Relaxed, |state| {
                (state != 0 && state != Self::EXCLUSIVE).then(|| state - 1)
            })
            .is_ok()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state().load(Relaxed);
        let owners = if state == Self::EXCLUSIVE { 1 } else { state };
        f.debug_struct("Lock")
            .field("exclusive", &(state == Self::EXCLUSIVE))
            .field("owners", &owners)
            .finish()
    }
}
