//! Hash buckets.
//!
//! Each [`Bucket`] pairs a priority-ordered list of waiters with a pending-waiter counter. The
//! counter is incremented before a waiter reads the futex word and is read by wakers after they
//! wrote it, so a waker that sees no waiters may skip the bucket lock without missing anyone.

use std::hash::{BuildHasher, BuildHasherDefault, DefaultHasher};
use std::sync::Arc;
use std::sync::atomic::Ordering::SeqCst;
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicUsize, fence};

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicUsize, fence};

use crate::key::Key;
use crate::lock_api::{Mutex, MutexGuard};
use crate::waiter::Waiter;

/// Hash bucket.
#[derive(Debug)]
pub(crate) struct Bucket {
    /// Waiters counted before they check the futex word.
    waiters: AtomicUsize,
    /// Queued waiters.
    queue: Mutex<WaitList>,
}

/// Priority-ordered waiters of one bucket; FIFO among equal priorities.
#[derive(Debug, Default)]
pub(crate) struct WaitList {
    entries: Vec<Arc<Waiter>>,
}

/// Fixed array of buckets.
#[derive(Debug)]
pub(crate) struct HashTable {
    buckets: Box<[Bucket]>,
    hasher: BuildHasherDefault<DefaultHasher>,
}

/// Two bucket locks taken in index order.
pub(crate) struct LockedPair<'t> {
    low_index: usize,
    low: MutexGuard<'t, WaitList>,
    high: Option<MutexGuard<'t, WaitList>>,
}

impl Bucket {
    /// Counts a waiter that is about to read the futex word.
    #[inline]
    pub(crate) fn waiters_inc(&self) {
        self.waiters.fetch_add(1, SeqCst);
        fence(SeqCst);
    }

    /// Forgets a waiter counted by [`Bucket::waiters_inc`].
    #[inline]
    pub(crate) fn waiters_dec(&self) {
        self.waiters.fetch_sub(1, SeqCst);
    }

    /// Returns `true` if a waiter may be queued, or about to be.
    ///
    /// Must be called after the caller's write to the futex word.
    #[inline]
    pub(crate) fn has_waiters(&self) -> bool {
        fence(SeqCst);
        // Read-modify-write: observes the latest increment in modification order.
        self.waiters.fetch_add(0, SeqCst) != 0
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, WaitList> {
        self.queue.lock()
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.waiters.load(SeqCst)
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            waiters: AtomicUsize::new(0),
            queue: Mutex::new(WaitList::default()),
        }
    }
}

impl WaitList {
    /// Links `waiter` behind every waiter of equal or higher priority.
    pub(crate) fn insert(&mut self, waiter: Arc<Waiter>) {
        let priority = waiter.priority();
        let position = self
            .entries
            .iter()
            .position(|queued| queued.priority() < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, waiter);
    }

    /// Unlinks `waiter`; returns `false` if it was not linked.
    pub(crate) fn remove(&mut self, waiter: &Arc<Waiter>) -> bool {
        if let Some(position) = self.entries.iter().position(|e| Arc::ptr_eq(e, waiter)) {
            self.entries.remove(position);
            true
        } else {
            false
        }
    }

    /// Returns the highest-priority waiter on `key`.
    pub(crate) fn top_waiter(&self, key: &Key) -> Option<Arc<Waiter>> {
        self.entries.iter().find(|e| e.waits_on(key)).cloned()
    }

    /// Returns the waiters on `key` in queue order.
    pub(crate) fn matching(&self, key: &Key) -> Vec<Arc<Waiter>> {
        self.entries
            .iter()
            .filter(|e| e.waits_on(key))
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl HashTable {
    /// Creates a table of at least `buckets` buckets.
    pub(crate) fn new(buckets: usize) -> Self {
        let len = buckets.max(1).next_power_of_two();
        Self {
            buckets: (0..len).map(|_| Bucket::default()).collect(),
            hasher: BuildHasherDefault::default(),
        }
    }

    /// Returns the index of the bucket `key` hashes to.
    #[inline]
    pub(crate) fn index_of(&self, key: &Key) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let hash = self.hasher.hash_one(key) as usize;
        hash & (self.buckets.len() - 1)
    }

    #[inline]
    pub(crate) fn bucket(&self, index: usize) -> &Bucket {
        &self.buckets[index]
    }

    /// Locks two buckets, lower index first; locks once if both indexes are equal.
    pub(crate) fn lock_pair(&self, first: usize, second: usize) -> LockedPair<'_> {
        let (low_index, high_index) = if first <= second {
            (first, second)
        } else {
            (second, first)
        };
        let low = self.buckets[low_index].lock();
        let high = (high_index != low_index).then(|| self.buckets[high_index].lock());
        LockedPair {
            low_index,
            low,
            high,
        }
    }
}

impl LockedPair<'_> {
    /// Returns the list of bucket `index`, which must be one of the locked buckets.
    pub(crate) fn list(&mut self, index: usize) -> &mut WaitList {
        match &mut self.high {
            Some(high) if index != self.low_index => &mut **high,
            _ => &mut *self.low,
        }
    }

    /// Returns the list of bucket `from`, and the other locked list if it is a different bucket.
    pub(crate) fn split(&mut self, from: usize) -> (&mut WaitList, Option<&mut WaitList>) {
        let Self {
            low_index,
            low,
            high,
        } = self;
        let from_low = from == *low_index;
        match high {
            None => (&mut **low, None),
            Some(high) => {
                if from_low {
                    (&mut **low, Some(&mut **high))
                } else {
                    (&mut **high, Some(&mut **low))
                }
            }
        }
    }
}
