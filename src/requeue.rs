//! Moving waiters from one futex word to another.
//!
//! A plain requeue wakes some waiters of the source word and relinks the rest onto the
//! destination word without waking them. The PI variant moves waiters that called
//! [`Futex::wait_requeue_pi`] onto a PI lock: the top waiter may be handed the lock outright, and
//! the others are queued on the lock's underlying mutex while they still sleep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;

use crate::bucket::LockedPair;
use crate::config::Config;
use crate::error::Error;
use crate::futex::Futex;
use crate::key::{self, Key, Scope};
use crate::memory::AddressSpace;
use crate::pi::{Acquisition, PiState, PiStateRef};
use crate::retry::{self, Step};
use crate::rt_mutex::{self, RtWaiter};
use crate::task::{Task, Wakeup};
use crate::wait::wake_all;
use crate::waiter::Waiter;

/// Arguments of [`Futex::requeue`].
///
/// # Examples
///
/// ```
/// use futex_engine::{Requeue, Scope};
///
/// let request = Requeue::new(0x1_0000, 0x1_0004)
///     .scope(Scope::Shared)
///     .wake(1)
///     .requeue(16)
///     .expect(3);
/// assert_eq!(request.max_requeue, 16);
/// assert!(!request.pi);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Requeue {
    /// Address of the word the waiters wait on.
    pub source: usize,
    /// Address of the word the waiters are moved to.
    pub destination: usize,
    /// Scope of both addresses.
    pub scope: Scope,
    /// Maximum number of waiters woken.
    pub max_wake: usize,
    /// Maximum number of waiters moved.
    pub max_requeue: usize,
    /// Value the source word must hold, if checked.
    pub expected: Option<u32>,
    /// The destination is a PI lock and the waiters called [`Futex::wait_requeue_pi`].
    pub pi: bool,
}

/// How the PI lock was settled for the top waiter.
enum Proxy {
    /// No waiter on the source word.
    NoWaiters,
    /// The top waiter was handed the lock.
    Acquired,
    /// The lock is held; waiters queue on the returned state.
    Contended(PiStateRef),
}

/// Everything an attempt collects that must be acted on after the bucket locks are released.
#[derive(Default)]
struct Deferred {
    woken: Vec<Arc<Waiter>>,
    chain_walks: Vec<Arc<PiState>>,
}

impl Requeue {
    /// Requeues from `source` to `destination`, waking one waiter and moving all others.
    #[must_use]
    pub fn new(source: usize, destination: usize) -> Self {
        Self {
            source,
            destination,
            scope: Scope::Private,
            max_wake: 1,
            max_requeue: usize::MAX,
            expected: None,
            pi: false,
        }
    }

    /// Sets the scope of both addresses.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the maximum number of waiters woken.
    #[must_use]
    pub fn wake(mut self, max_wake: usize) -> Self {
        self.max_wake = max_wake;
        self
    }

    /// Sets the maximum number of waiters moved.
    #[must_use]
    pub fn requeue(mut self, max_requeue: usize) -> Self {
        self.max_requeue = max_requeue;
        self
    }

    /// Requires the source word to hold `expected`.
    #[must_use]
    pub fn expect(mut self, expected: u32) -> Self {
        self.expected = Some(expected);
        self
    }

    /// Moves requeue-PI waiters onto the PI lock at the destination; at most one is woken.
    #[must_use]
    pub fn pi(mut self) -> Self {
        self.pi = true;
        self.max_wake = 1;
        self
    }
}

impl<C: Config> Futex<C> {
    /// Wakes up to `max_wake` waiters of the source word and moves up to `max_requeue` more to
    /// the destination word.
    ///
    /// Returns the number of waiters woken plus moved. In PI mode a waiter handed the lock
    /// counts as woken.
    ///
    /// # Errors
    ///
    /// * [`Error::Conflict`] if the source word does not hold the expected value.
    /// * [`Error::InvalidArgument`] if PI mode is combined with `max_wake != 1` or equal words,
    ///   or a waiter's kind does not match the mode.
    /// * [`Error::Deadlock`], [`Error::OwnerProcessGone`] or [`Error::Corrupted`] while settling
    ///   the PI lock for the top waiter.
    /// * [`Error::Fault`] if either word is not mapped.
    pub fn requeue(&self, task: &Arc<Task>, request: &Requeue) -> Result<usize, Error> {
        if request.pi && (request.max_wake != 1 || request.source == request.destination) {
            return Err(Error::InvalidArgument);
        }
        retry::bounded(C::retry_limit(), || self.requeue_once(task, request))
    }

    /// Waits on the word at `address` like [`Futex::wait`], expecting to be moved onto the PI
    /// lock at `pi_address` by a PI [`Futex::requeue`] and to return owning it.
    ///
    /// # Errors
    ///
    /// * [`Error::ValueMismatch`] if the word does not hold `expected`, or the wait ended before
    ///   the waiter was moved for a reason other than a timeout or an interruption.
    /// * [`Error::TimedOut`] or [`Error::Interrupted`] if the wait ended before the waiter was
    ///   moved.
    /// * [`Error::TimedOut`] if the waiter was moved but did not get the lock in time.
    /// * [`Error::InvalidArgument`] for an empty `bitset` or equal words.
    #[allow(clippy::too_many_arguments)]
    pub fn wait_requeue_pi(
        &self,
        task: &Arc<Task>,
        address: usize,
        scope: Scope,
        expected: u32,
        bitset: u32,
        timeout: Option<Duration>,
        pi_address: usize,
    ) -> Result<(), Error> {
        if bitset == 0 || address == pi_address {
            return Err(Error::InvalidArgument);
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let space = task.space();
        let key = key::resolve(space, address, scope)?;
        let target = key::resolve(space, pi_address, scope)?;
        if key == target {
            return Err(Error::InvalidArgument);
        }
        let rt_waiter = RtWaiter::new(task);
        let waiter = Waiter::new_requeue_pi(task, key, bitset, target, rt_waiter.clone());
        self.wait_setup(space, address, expected, &waiter)?;

        let wakeup = task.block_until(deadline, || waiter.is_woken() || rt_waiter.is_acquired());

        let (index, mut list) = self.queue_lock(&waiter);
        let (requeued, handed_over, pi_state) = {
            let state = waiter.state();
            (
                state.key == target,
                state.rt_waiter.is_none(),
                state.pi_state.clone(),
            )
        };
        if !requeued {
            let queued = std::mem::replace(&mut waiter.state().queued, false);
            if queued {
                list.remove(&waiter);
                self.table.bucket(index).waiters_dec();
            }
            return Err(match wakeup {
                Wakeup::TimedOut => Error::TimedOut,
                Wakeup::Interrupted => Error::Interrupted,
                Wakeup::Ready => Error::ValueMismatch,
            });
        }

        if handed_over {
            // The requeue itself made the word name this task.
            let result = match &pi_state {
                Some(pi_state) => {
                    Self::fixup_owner(space, pi_address, pi_state, task, true).map(|_| ())
                }
                None => Ok(()),
            };
            let taken = waiter.state().pi_state.take();
            drop(list);
            drop(taken);
            return result;
        }
        drop(list);

        let Some(pi_state) = pi_state else {
            return Err(Error::Corrupted);
        };
        let result = rt_waiter.wait(deadline);
        match self.finish_proxy_wait(task, pi_address, &waiter, pi_state, &rt_waiter, result) {
            // The requeue already happened; the caller must re-evaluate.
            Err(Error::Interrupted) => Err(Error::ValueMismatch),
            result => result,
        }
    }

    fn requeue_once(&self, task: &Arc<Task>, request: &Requeue) -> Step<usize> {
        let space = task.space();
        let key1 = key::resolve(space, request.source, request.scope)?;
        let key2 = key::resolve(space, request.destination, request.scope)?;
        if request.pi && key1 == key2 {
            return Err(Error::InvalidArgument.into());
        }
        let index1 = self.table.index_of(&key1);
        let index2 = self.table.index_of(&key2);
        let destination = self.table.bucket(index2);

        // Counted so that a waker of the destination does not skip its bucket meanwhile.
        destination.waiters_inc();
        let mut deferred = Deferred::default();
        let result = {
            let mut pair = self.table.lock_pair(index1, index2);
            self.requeue_locked(
                space,
                request,
                &mut pair,
                (index1, &key1),
                (index2, &key2),
                &mut deferred,
            )
        };
        destination.waiters_dec();

        wake_all(deferred.woken);
        for lock in deferred.chain_walks {
            rt_mutex::adjust_prio_chain(&lock, None, C::lock_depth_limit()).ok();
        }
        result
    }

    fn requeue_locked(
        &self,
        space: &AddressSpace,
        request: &Requeue,
        pair: &mut LockedPair<'_>,
        (index1, key1): (usize, &Key),
        (index2, key2): (usize, &Key),
        deferred: &mut Deferred,
    ) -> Step<usize> {
        if let Some(expected) = request.expected {
            if space.load(request.source)? != expected {
                return Err(Error::Conflict.into());
            }
        }

        let limit = request.max_wake.saturating_add(request.max_requeue);
        let mut count = 0;
        let mut pi_state = None;
        if request.pi {
            let set_waiters = request.max_requeue > 0;
            let proxy = self.proxy_trylock_atomic(
                space,
                request,
                pair,
                (index1, key1),
                (index2, key2),
                set_waiters,
                deferred,
            )?;
            match proxy {
                Proxy::NoWaiters => return Ok(0),
                Proxy::Acquired => {
                    count += 1;
                    let uval = space.load(request.destination)?;
                    pi_state = Some(self.lookup_pi_state(
                        space,
                        request.destination,
                        uval,
                        pair.list(index2),
                        key2,
                    )?);
                }
                Proxy::Contended(existing) => pi_state = Some(existing),
            }
        }

        for waiter in pair.list(index1).matching(key1) {
            if count >= limit {
                break;
            }
            let (attached, rt_waiter, target) = {
                let state = waiter.state();
                (state.pi_state.is_some(), state.rt_waiter.clone(), state.requeue_pi_key)
            };
            if attached || request.pi != rt_waiter.is_some() {
                return Err(Error::InvalidArgument.into());
            }
            count += 1;

            if !request.pi {
                if count <= request.max_wake {
                    let bucket = self.table.bucket(index1);
                    Self::mark_woken(bucket, pair.list(index1), &waiter, &mut deferred.woken);
                } else {
                    self.requeue_waiter(pair, index1, index2, key2, &waiter);
                }
                continue;
            }

            if target != Some(*key2) {
                return Err(Error::InvalidArgument.into());
            }
            let (Some(pi_state), Some(rt_waiter)) = (&pi_state, rt_waiter) else {
                return Err(Error::Corrupted.into());
            };
            waiter.state().pi_state = Some(pi_state.clone());
            let acquired = {
                let mut inner = pi_state.lock();
                pi_state.arc().start_proxy_lock(&mut inner, &rt_waiter)
            };
            if acquired {
                self.requeue_pi_wake(pair, index1, index2, key2, &waiter, &mut deferred.woken);
            } else {
                deferred.chain_walks.push(pi_state.arc().clone());
                self.requeue_waiter(pair, index1, index2, key2, &waiter);
            }
        }
        Ok(count)
    }

    /// Tries to take the PI lock on behalf of the top waiter of the source word.
    #[allow(clippy::too_many_arguments)]
    fn proxy_trylock_atomic(
        &self,
        space: &AddressSpace,
        request: &Requeue,
        pair: &mut LockedPair<'_>,
        (index1, key1): (usize, &Key),
        (index2, key2): (usize, &Key),
        set_waiters: bool,
        deferred: &mut Deferred,
    ) -> Step<Proxy> {
        space.load(request.destination)?;
        let Some(top) = pair.list(index1).top_waiter(key1) else {
            return Ok(Proxy::NoWaiters);
        };
        if top.state().requeue_pi_key != Some(*key2) {
            return Err(Error::InvalidArgument.into());
        }
        let Some(owner) = top.task().upgrade() else {
            return Err(Error::Corrupted.into());
        };
        let list2 = pair.list(index2);
        match self.lock_pi_atomic(space, request.destination, list2, key2, &owner, set_waiters)? {
            Acquisition::Acquired => {
                self.requeue_pi_wake(pair, index1, index2, key2, &top, &mut deferred.woken);
                Ok(Proxy::Acquired)
            }
            Acquisition::Attached(pi_state) => Ok(Proxy::Contended(pi_state)),
        }
    }

    /// Wakes a requeue-PI waiter that was handed the lock; it is not linked into the destination.
    fn requeue_pi_wake(
        &self,
        pair: &mut LockedPair<'_>,
        index1: usize,
        index2: usize,
        key2: &Key,
        waiter: &Arc<Waiter>,
        woken: &mut Vec<Arc<Waiter>>,
    ) {
        pair.list(index1).remove(waiter);
        self.table.bucket(index1).waiters_dec();
        {
            let mut state = waiter.state();
            state.key = *key2;
            state.bucket = index2;
            state.queued = false;
            state.rt_waiter = None;
        }
        woken.push(waiter.clone());
    }

    /// Moves `waiter` from bucket `index1` to bucket `index2` and rekeys it.
    fn requeue_waiter(
        &self,
        pair: &mut LockedPair<'_>,
        index1: usize,
        index2: usize,
        key2: &Key,
        waiter: &Arc<Waiter>,
    ) {
        let (from, to) = pair.split(index1);
        if let Some(to) = to {
            from.remove(waiter);
            to.insert(waiter.clone());
            self.table.bucket(index1).waiters_dec();
            self.table.bucket(index2).waiters_inc();
        }
        let mut state = waiter.state();
        state.key = *key2;
        state.bucket = index2;
        trace!("requeued {waiter:?} onto {key2:?}");
    }
}
