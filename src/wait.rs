//! Waiting on futex words and waking their waiters.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;

use crate::bucket::{Bucket, WaitList};
use crate::config::Config;
use crate::error::Error;
use crate::futex::Futex;
use crate::key::{self, Key, Scope};
use crate::lock_api::MutexGuard;
use crate::memory::AddressSpace;
use crate::opcode::WakeOp;
use crate::task::{Task, Wakeup};
use crate::waiter::{Waiter, Woken};
use crate::word::BITSET_MATCH_ANY;

/// Unqueues an async waiter whose future was dropped before it was woken.
struct Cancellation<'f, C: Config> {
    futex: &'f Futex<C>,
    waiter: &'f Arc<Waiter>,
    armed: bool,
}

impl<C: Config> Drop for Cancellation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.futex.unqueue(self.waiter);
        }
    }
}

/// Wakes waiters that were removed from their buckets; the bucket locks must be released.
pub(crate) fn wake_all(woken: Vec<Arc<Waiter>>) {
    for waiter in woken {
        waiter.wake();
    }
}

impl<C: Config> Futex<C> {
    /// Blocks `task` while the word at `address` holds `expected`.
    ///
    /// The word is read under the bucket lock after `task` was counted as a pending waiter, so a
    /// [`Futex::wake`] issued after the word was changed cannot miss it. `bitset` selects which
    /// wake calls may wake the task.
    ///
    /// # Errors
    ///
    /// * [`Error::ValueMismatch`] if the word does not hold `expected`.
    /// * [`Error::TimedOut`] or [`Error::Interrupted`] if the wait ended without a wake-up.
    /// * [`Error::InvalidArgument`] for an empty `bitset` or a misaligned address.
    /// * [`Error::Fault`] if the address is not mapped.
    pub fn wait(
        &self,
        task: &Arc<Task>,
        address: usize,
        scope: Scope,
        expected: u32,
        bitset: u32,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        if bitset == 0 {
            return Err(Error::InvalidArgument);
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let key = key::resolve(task.space(), address, scope)?;
        let waiter = Waiter::new(task, key, bitset);
        self.wait_setup(task.space(), address, expected, &waiter)?;

        let wakeup = task.block_until(deadline, || waiter.is_woken());
        if !self.unqueue(&waiter) {
            // A waker got there first.
            return Ok(());
        }
        match wakeup {
            Wakeup::Ready => Ok(()),
            Wakeup::TimedOut => Err(Error::TimedOut),
            Wakeup::Interrupted => Err(Error::Interrupted),
        }
    }

    /// Waits like [`Futex::wait`] without blocking the thread.
    ///
    /// Dropping the future before it completes withdraws the waiter.
    ///
    /// # Errors
    ///
    /// Fails like [`Futex::wait`] apart from timeouts and interruptions, which are left to the
    /// executor.
    ///
    /// # Examples
    ///
    /// ```
    /// use futex_engine::{AddressSpace, BITSET_MATCH_ANY, Error, Futex, Priority, Scope};
    ///
    /// async fn mismatch() {
    ///     let futex = Futex::new();
    ///     let space = AddressSpace::new();
    ///     let task = futex.tasks().register(space.clone(), Priority::NORMAL);
    ///     let word = space.map_private(4);
    ///     let result = futex.wait_async(&task, word, Scope::Private, 7, BITSET_MATCH_ANY).await;
    ///     assert_eq!(result, Err(Error::ValueMismatch));
    /// }
    /// ```
    pub async fn wait_async(
        &self,
        task: &Arc<Task>,
        address: usize,
        scope: Scope,
        expected: u32,
        bitset: u32,
    ) -> Result<(), Error> {
        if bitset == 0 {
            return Err(Error::InvalidArgument);
        }
        let key = key::resolve(task.space(), address, scope)?;
        let waiter = Waiter::new_async(task, key, bitset);
        self.wait_setup(task.space(), address, expected, &waiter)?;

        let mut cancellation = Cancellation {
            futex: self,
            waiter: &waiter,
            armed: true,
        };
        Woken(&waiter).await;
        cancellation.armed = false;
        Ok(())
    }

    /// Wakes at most `max_count` waiters on the word at `address` whose bitsets intersect
    /// `bitset`, highest priority first, and returns how many were woken.
    ///
    /// # Errors
    ///
    /// * [`Error::InvalidArgument`] for an empty `bitset`, or if a waiter on the word is a PI
    ///   waiter.
    /// * [`Error::Fault`] if a shared address is not mapped.
    pub fn wake(
        &self,
        task: &Arc<Task>,
        address: usize,
        scope: Scope,
        max_count: usize,
        bitset: u32,
    ) -> Result<usize, Error> {
        if bitset == 0 {
            return Err(Error::InvalidArgument);
        }
        let key = key::resolve(task.space(), address, scope)?;
        self.wake_key(&key, max_count, bitset)
    }

    /// Applies `op` to the word at `address2`, wakes up to `max1` waiters on `address1`, and, if
    /// the old value of the second word satisfies the comparison of `op`, up to `max2` waiters
    /// on `address2`.
    ///
    /// Both buckets stay locked while the word is modified and the waiters are unlinked; the
    /// unlinked waiters are woken once the locks are released. Returns the total number of
    /// waiters woken.
    ///
    /// # Errors
    ///
    /// * [`Error::Fault`] if either address is not mapped.
    /// * [`Error::InvalidArgument`] for misaligned addresses or PI waiters on either word.
    #[allow(clippy::too_many_arguments)]
    pub fn wake_op(
        &self,
        task: &Arc<Task>,
        address1: usize,
        address2: usize,
        scope: Scope,
        max1: usize,
        max2: usize,
        op: WakeOp,
    ) -> Result<usize, Error> {
        let space = task.space();
        let key1 = key::resolve(space, address1, scope)?;
        let key2 = key::resolve(space, address2, scope)?;
        let index1 = self.table.index_of(&key1);
        let index2 = self.table.index_of(&key2);

        let mut woken = Vec::new();
        let result = {
            let mut pair = self.table.lock_pair(index1, index2);
            space.apply(address2, &op).and_then(|old| {
                let first = Self::wake_matching(
                    self.table.bucket(index1),
                    pair.list(index1),
                    &key1,
                    max1,
                    BITSET_MATCH_ANY,
                    &mut woken,
                )?;
                if !op.compare(old) {
                    return Ok(first);
                }
                let second = Self::wake_matching(
                    self.table.bucket(index2),
                    pair.list(index2),
                    &key2,
                    max2,
                    BITSET_MATCH_ANY,
                    &mut woken,
                )?;
                Ok(first + second)
            })
        };
        wake_all(woken);
        result
    }

    /// Wakes up to `max_count` waiters on `key`.
    pub(crate) fn wake_key(
        &self,
        key: &Key,
        max_count: usize,
        bitset: u32,
    ) -> Result<usize, Error> {
        let bucket = self.table.bucket(self.table.index_of(key));
        if max_count == 0 || !bucket.has_waiters() {
            return Ok(0);
        }
        let mut woken = Vec::new();
        let result =
            Self::wake_matching(bucket, &mut bucket.lock(), key, max_count, bitset, &mut woken);
        wake_all(woken);
        result
    }

    /// Counts the waiter, checks the word, and queues the waiter if it holds `expected`.
    pub(crate) fn wait_setup(
        &self,
        space: &AddressSpace,
        address: usize,
        expected: u32,
        waiter: &Arc<Waiter>,
    ) -> Result<(), Error> {
        let key = waiter.state().key;
        let index = self.table.index_of(&key);
        let bucket = self.table.bucket(index);
        bucket.waiters_inc();
        let mut list = bucket.lock();
        let result = match space.load(address) {
            Ok(value) if value == expected => Ok(()),
            Ok(_) => Err(Error::ValueMismatch),
            Err(error) => Err(error),
        };
        if result.is_ok() {
            Self::queue(&mut list, index, waiter);
        } else {
            drop(list);
            bucket.waiters_dec();
        }
        result
    }

    /// Links `waiter` into the locked bucket `index`; the waiter is already counted.
    pub(crate) fn queue(list: &mut WaitList, index: usize, waiter: &Arc<Waiter>) {
        {
            let mut state = waiter.state();
            state.bucket = index;
            state.queued = true;
        }
        list.insert(waiter.clone());
    }

    /// Locks the bucket `waiter` is currently linked into, following requeues.
    pub(crate) fn queue_lock(&self, waiter: &Waiter) -> (usize, MutexGuard<'_, WaitList>) {
        loop {
            let index = waiter.state().bucket;
            let list = self.table.bucket(index).lock();
            if waiter.state().bucket == index {
                return (index, list);
            }
        }
    }

    /// Unlinks `waiter` unless a waker already did; returns `true` if it was still queued.
    pub(crate) fn unqueue(&self, waiter: &Arc<Waiter>) -> bool {
        let (index, mut list) = self.queue_lock(waiter);
        {
            let mut state = waiter.state();
            if !state.queued {
                return false;
            }
            state.queued = false;
        }
        list.remove(waiter);
        self.table.bucket(index).waiters_dec();
        true
    }

    /// Unlinks a PI waiter under its bucket lock and releases its PI state reference.
    pub(crate) fn unqueue_pi(bucket: &Bucket, list: &mut WaitList, waiter: &Arc<Waiter>) {
        let (queued, pi_state) = {
            let mut state = waiter.state();
            (std::mem::replace(&mut state.queued, false), state.pi_state.take())
        };
        if queued {
            list.remove(waiter);
            bucket.waiters_dec();
        }
        drop(pi_state);
    }

    /// Removes a woken waiter from its bucket and collects it for [`wake_all`].
    pub(crate) fn mark_woken(
        bucket: &Bucket,
        list: &mut WaitList,
        waiter: &Arc<Waiter>,
        woken: &mut Vec<Arc<Waiter>>,
    ) {
        list.remove(waiter);
        waiter.state().queued = false;
        bucket.waiters_dec();
        woken.push(waiter.clone());
    }

    fn wake_matching(
        bucket: &Bucket,
        list: &mut WaitList,
        key: &Key,
        max_count: usize,
        bitset: u32,
        woken: &mut Vec<Arc<Waiter>>,
    ) -> Result<usize, Error> {
        let mut count = 0;
        for waiter in list.matching(key) {
            if count >= max_count {
                break;
            }
            {
                let state = waiter.state();
                if state.pi_state.is_some() || state.rt_waiter.is_some() {
                    return Err(Error::InvalidArgument);
                }
            }
            if waiter.bitset() & bitset == 0 {
                continue;
            }
            Self::mark_woken(bucket, list, &waiter, woken);
            count += 1;
        }
        if count != 0 {
            trace!("woke {count} waiters on {key:?}");
        }
        Ok(count)
    }
}
