//! The userspace half of the lock protocols.
//!
//! Lock words are meant to be taken and released with a single compare-and-swap when
//! uncontended; only contention enters the [`Futex`] engine. [`PiMutex`] packages that protocol
//! for priority-inheritance locks, and [`RobustList`] maintains the list of held locks that the
//! engine walks when a task exits.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::Error;
use crate::futex::Futex;
use crate::key::Scope;
use crate::memory::AddressSpace;
use crate::robust::{PI_ENTRY, ROBUST_LIST_HEAD_SIZE, pointer};
use crate::task::Task;

/// Takes the PI lock at `address` if it is unlocked, without entering the engine.
///
/// # Errors
///
/// Returns [`Error::Fault`] if the word is not mapped.
pub fn try_lock_pi_fast(task: &Task, address: usize) -> Result<bool, Error> {
    Ok(task.space().compare_exchange(address, 0, task.tid())? == 0)
}

/// Releases the PI lock at `address` if it names `task` without any flags, without entering the
/// engine.
///
/// Returns `false` if the engine must release the lock.
///
/// # Errors
///
/// Returns [`Error::Fault`] if the word is not mapped.
pub fn unlock_pi_fast(task: &Task, address: usize) -> Result<bool, Error> {
    let tid = task.tid();
    Ok(task.space().compare_exchange(address, tid, 0)? == tid)
}

/// A priority-inheritance mutex living in user memory.
///
/// # Examples
///
/// ```
/// use futex_engine::{AddressSpace, Futex, Priority, Scope};
/// use futex_engine::user::PiMutex;
///
/// let futex = Futex::new();
/// let space = AddressSpace::new();
/// let task = futex.tasks().register(space.clone(), Priority::NORMAL);
/// let mutex = PiMutex::new(space.map_private(4), Scope::Private);
///
/// mutex.lock(&futex, &task, None).unwrap();
/// assert!(!mutex.try_lock(&futex, &task).unwrap());
/// mutex.unlock(&futex, &task).unwrap();
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PiMutex {
    address: usize,
    scope: Scope,
}

impl PiMutex {
    /// Creates a handle for the lock word at `address`.
    #[must_use]
    pub const fn new(address: usize, scope: Scope) -> Self {
        Self { address, scope }
    }

    /// Returns the address of the lock word.
    #[must_use]
    pub const fn address(&self) -> usize {
        self.address
    }

    /// Acquires the lock, blocking in the engine if it is contended.
    ///
    /// # Errors
    ///
    /// Fails like [`Futex::lock_pi`].
    pub fn lock<C: Config>(
        &self,
        futex: &Futex<C>,
        task: &Arc<Task>,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        if try_lock_pi_fast(task, self.address)? {
            return Ok(());
        }
        futex.lock_pi(task, self.address, self.scope, timeout)
    }

    /// Acquires the lock if that does not require blocking; returns whether it was acquired.
    ///
    /// # Errors
    ///
    /// Fails like [`Futex::trylock_pi`], except that a held lock yields `Ok(false)`.
    pub fn try_lock<C: Config>(&self, futex: &Futex<C>, task: &Arc<Task>) -> Result<bool, Error> {
        if try_lock_pi_fast(task, self.address)? {
            return Ok(true);
        }
        match futex.trylock_pi(task, self.address, self.scope) {
            Ok(()) => Ok(true),
            Err(Error::WouldBlock | Error::Deadlock) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Releases the lock, entering the engine if waiters may be blocked.
    ///
    /// # Errors
    ///
    /// Fails like [`Futex::unlock_pi`].
    pub fn unlock<C: Config>(&self, futex: &Futex<C>, task: &Arc<Task>) -> Result<(), Error> {
        if unlock_pi_fast(task, self.address)? {
            return Ok(());
        }
        futex.unlock_pi(task, self.address, self.scope)
    }
}

/// Writer for a robust list in user memory.
///
/// Entries are addresses of list nodes; each node starts with the 8-byte address of the next
/// node, and its lock word lies at the offset given to [`RobustList::init`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RobustList {
    head: usize,
}

impl RobustList {
    /// Writes an empty list head at `head` and registers it for `task`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fault`] if the head is not mapped.
    pub fn init<C: Config>(
        futex: &Futex<C>,
        task: &Arc<Task>,
        head: usize,
        futex_offset: i64,
    ) -> Result<Self, Error> {
        let space = task.space();
        space.store_u64(head, pointer(head)?)?;
        space.store_u64(head + 8, u64::from_ne_bytes(futex_offset.to_ne_bytes()))?;
        space.store_u64(head + 16, 0)?;
        futex.register_lock_list(task, head, ROBUST_LIST_HEAD_SIZE)?;
        Ok(Self { head })
    }

    /// Returns the address of the head.
    #[must_use]
    pub const fn head(&self) -> usize {
        self.head
    }

    /// Links the node at `entry` at the front of the list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fault`] if the head or the node is not mapped.
    pub fn push(&self, space: &AddressSpace, entry: usize, pi: bool) -> Result<(), Error> {
        let first = space.load_u64(self.head)?;
        space.store_u64(entry, first)?;
        let mark = if pi { PI_ENTRY } else { 0 };
        space.store_u64(self.head, pointer(entry)? | mark)
    }

    /// Unlinks the node at `entry`; returns `false` if it was not linked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fault`] if a node is not mapped.
    pub fn remove(&self, space: &AddressSpace, entry: usize) -> Result<bool, Error> {
        let mut link = self.head;
        loop {
            let raw = space.load_u64(link)?;
            let node = usize::try_from(raw & !PI_ENTRY).map_err(|_| Error::Fault)?;
            if node == self.head {
                return Ok(false);
            }
            if node == entry {
                let next = space.load_u64(node)?;
                space.store_u64(link, next)?;
                return Ok(true);
            }
            link = node;
        }
    }
}
