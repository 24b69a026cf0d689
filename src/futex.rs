//! [`Futex`] is the engine shared by every task that synchronizes through futex words.

use std::fmt;
use std::marker::PhantomData;

use crate::bucket::HashTable;
use crate::config::{Config, DefaultConfig};
use crate::task::TaskRegistry;

/// [`Futex`] owns the hashed wait queues and the registry of tasks whose ids appear in lock
/// words.
///
/// Operations are grouped by concern: [`Futex::wait`] and [`Futex::wake`] for plain waiting,
/// [`Futex::lock_pi`] and its relatives for priority-inheritance locks, [`Futex::requeue`] for
/// moving waiters between words, and [`Futex::exit`] for releasing what a dying task held.
///
/// # Examples
///
/// ```
/// use futex_engine::{AddressSpace, BITSET_MATCH_ANY, Error, Futex, Priority, Scope};
///
/// let futex = Futex::new();
/// let space = AddressSpace::new();
/// let task = futex.tasks().register(space.clone(), Priority::NORMAL);
/// let word = space.map_private(4);
///
/// assert_eq!(
///     futex.wait(&task, word, Scope::Private, 1, BITSET_MATCH_ANY, None),
///     Err(Error::ValueMismatch)
/// );
/// assert_eq!(futex.wake(&task, word, Scope::Private, 1, BITSET_MATCH_ANY), Ok(0));
/// ```
pub struct Futex<C: Config = DefaultConfig> {
    /// Hash buckets.
    pub(crate) table: HashTable,
    /// Registered tasks.
    pub(crate) tasks: TaskRegistry,
    _config: PhantomData<fn() -> C>,
}

impl Futex<DefaultConfig> {
    /// Creates a [`Futex`] with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config()
    }
}

impl<C: Config> Futex<C> {
    /// Creates a [`Futex`] tuned by `C`.
    #[must_use]
    pub fn with_config() -> Self {
        Self {
            table: HashTable::new(C::hash_buckets()),
            tasks: TaskRegistry::default(),
            _config: PhantomData,
        }
    }

    /// Returns the registry resolving the task ids stored in lock words.
    #[inline]
    #[must_use]
    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }
}

impl Default for Futex<DefaultConfig> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Config> fmt::Debug for Futex<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Futex")
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}
