//! [`Config`] defines the tunables of a [`Futex`](crate::Futex) engine.

use std::fmt;
use std::num::NonZeroUsize;
use std::thread::available_parallelism;
#[cfg(not(feature = "loom"))]
use std::thread::yield_now;

#[cfg(feature = "loom")]
use loom::thread::yield_now;

/// [`Config`] defines the tunables of a [`Futex`](crate::Futex) engine.
pub trait Config: fmt::Debug + Default {
    /// Defines the number of hash buckets.
    ///
    /// The value is rounded up to a power of two when the engine is constructed.
    #[inline]
    #[must_use]
    fn hash_buckets() -> usize {
        let cpus = available_parallelism().map_or(1, NonZeroUsize::get);
        256 * cpus
    }

    /// Defines how many times an operation that lost a race against a concurrent change of the
    /// futex word is restarted before it fails with [`Error::Conflict`](crate::Error::Conflict).
    #[inline]
    #[must_use]
    fn retry_limit() -> usize {
        1 << 16
    }

    /// Defines the maximum number of robust-list entries processed when a task exits.
    #[inline]
    #[must_use]
    fn robust_list_limit() -> usize {
        2048
    }

    /// Defines the maximum number of locks visited by a priority-inheritance chain walk.
    #[inline]
    #[must_use]
    fn lock_depth_limit() -> usize {
        1024
    }
}

/// Default configuration.
#[derive(Debug, Default)]
pub struct DefaultConfig;

impl Config for DefaultConfig {}

/// Backoff between attempts to take a contended internal lock.
#[inline]
pub(crate) fn backoff(spin_count: usize) {
    if cfg!(feature = "loom") || spin_count % 64 == 0 {
        yield_now();
    } else {
        std::hint::spin_loop();
    }
}
