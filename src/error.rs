//! [`Error`] is the failure type of every futex operation.

use std::fmt;

/// [`Error`] is the failure type of every futex operation.
///
/// [`Error::ValueMismatch`] and [`Error::Conflict`] are expected outcomes that tell the caller to
/// re-evaluate its own state; they are not faults.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    /// Misaligned address, empty bitset, or an invalid combination of arguments.
    InvalidArgument,
    /// The futex word did not hold the expected value.
    ValueMismatch,
    /// The source word of a requeue changed, or a race could not be settled.
    Conflict,
    /// The timeout expired.
    TimedOut,
    /// The blocked task was interrupted.
    Interrupted,
    /// The address is not mapped.
    Fault,
    /// The caller already owns the lock, or waiting would close a lock cycle.
    Deadlock,
    /// The lock word names an owner that no longer exists.
    OwnerProcessGone,
    /// The caller does not own the lock it tried to release.
    NotOwner,
    /// The lock is held and the caller asked not to block.
    WouldBlock,
    /// Priority-inheritance state disagrees with the lock word.
    Corrupted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::InvalidArgument => "invalid argument",
            Error::ValueMismatch => "futex word did not match the expected value",
            Error::Conflict => "futex word changed concurrently",
            Error::TimedOut => "timed out",
            Error::Interrupted => "interrupted",
            Error::Fault => "address not mapped",
            Error::Deadlock => "deadlock detected",
            Error::OwnerProcessGone => "lock owner no longer exists",
            Error::NotOwner => "lock not owned by the caller",
            Error::WouldBlock => "lock is held",
            Error::Corrupted => "inconsistent priority-inheritance state",
        };
        f.write_str(text)
    }
}

impl std::error::Error for Error {}
