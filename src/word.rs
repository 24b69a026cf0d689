//! Layout of priority-inheritance and robust lock words.
//!
//! A lock word holds the owner's task id in its low 30 bits and two flags in the high bits. A word
//! of `0` is an unlocked lock.

use bitflags::bitflags;

bitflags! {
    /// Flags carried by a lock word next to the owner's task id.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct WordFlags: u32 {
        /// Waiters may be blocked in the engine; releasing the lock must enter the engine.
        const WAITERS = 0x8000_0000;
        /// The previous owner exited while holding the lock.
        const OWNER_DIED = 0x4000_0000;
    }
}

/// Mask of the owner task id.
pub const TID_MASK: u32 = 0x3fff_ffff;

/// Bitset matching every waiter.
pub const BITSET_MATCH_ANY: u32 = u32::MAX;

pub(crate) const WAITERS: u32 = WordFlags::WAITERS.bits();
pub(crate) const OWNER_DIED: u32 = WordFlags::OWNER_DIED.bits();

/// Extracts the owner task id from a lock word.
///
/// # Examples
///
/// ```
/// use futex_engine::word::{owner, WordFlags};
///
/// assert_eq!(owner(WordFlags::WAITERS.bits() | 7), 7);
/// ```
#[inline]
#[must_use]
pub const fn owner(word: u32) -> u32 {
    word & TID_MASK
}

/// Extracts the flags from a lock word.
///
/// # Examples
///
/// ```
/// use futex_engine::word::{flags, WordFlags};
///
/// assert_eq!(flags(0xc000_0001), WordFlags::WAITERS | WordFlags::OWNER_DIED);
/// ```
#[inline]
#[must_use]
pub const fn flags(word: u32) -> WordFlags {
    WordFlags::from_bits_truncate(word)
}
