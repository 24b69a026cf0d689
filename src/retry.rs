//! Bounded restart of operations that re-validate user memory after taking locks.

use std::sync::Arc;
use std::thread::yield_now;

use log::warn;

use crate::error::Error;
use crate::task::Task;

/// Outcome of an attempt that did not complete.
#[derive(Debug)]
pub(crate) enum Interim {
    /// The operation failed.
    Fail(Error),
    /// The futex word changed under the operation; start over.
    Retry,
    /// The lock owner is exiting; start over once its exit cleanup has finished.
    OwnerExiting(Arc<Task>),
}

impl From<Error> for Interim {
    #[inline]
    fn from(error: Error) -> Self {
        Interim::Fail(error)
    }
}

/// Result of one attempt.
pub(crate) type Step<T> = Result<T, Interim>;

/// Runs `attempt` until it completes, restarting it at most `limit` times.
///
/// Exhausting the limit is reported as [`Error::Conflict`].
pub(crate) fn bounded<T, F: FnMut() -> Step<T>>(limit: usize, mut attempt: F) -> Result<T, Error> {
    for _ in 0..limit {
        match attempt() {
            Ok(result) => return Ok(result),
            Err(Interim::Fail(error)) => return Err(error),
            Err(Interim::Retry) => yield_now(),
            Err(Interim::OwnerExiting(owner)) => owner.wait_for_exit(),
        }
    }
    warn!("operation restarted {limit} times without settling");
    Err(Error::Conflict)
}
