//! Priority-inheritance locks.
//!
//! A [`PiState`] exists while a PI lock word is contended. It records the owner the engine
//! believes holds the lock and embeds the [`RtMutex`] the waiters block on. The state is
//! reference counted by the waiters attached to it; when the last reference goes away it is
//! detached from its owner and dropped, and the lock word alone describes the lock again.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::bucket::WaitList;
use crate::config::Config;
use crate::error::Error;
use crate::futex::Futex;
use crate::key::{self, Key, Scope};
use crate::lock_api::{Mutex, MutexGuard};
use crate::memory::AddressSpace;
use crate::retry::{self, Interim, Step};
use crate::rt_mutex::{self, RtMutex, RtWaiter};
use crate::task::{ExitState, Task, TaskRef};
use crate::waiter::Waiter;
use crate::word::{self, BITSET_MATCH_ANY, OWNER_DIED, WAITERS};

/// PI state id allocator; ids key the priority donations of owners.
static PI_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// Kernel-side state of a contended PI lock.
pub(crate) struct PiState {
    /// Unique id.
    id: u64,
    /// Key of the lock word.
    key: Key,
    /// References held by attached waiters and in-flight operations.
    refs: AtomicUsize,
    /// Owner and underlying mutex.
    inner: Mutex<PiInner>,
}

/// Guarded part of a [`PiState`].
#[derive(Debug)]
pub(crate) struct PiInner {
    /// The task the lock word should name; `None` after the owner died.
    pub(crate) owner: Option<TaskRef>,
    /// The mutex waiters block on.
    pub(crate) rt: RtMutex,
}

/// Counted reference to a [`PiState`].
pub(crate) struct PiStateRef(Arc<PiState>);

/// Outcome of an atomic acquisition attempt on a PI lock word.
#[derive(Debug)]
pub(crate) enum Acquisition {
    /// The word now names the caller.
    Acquired,
    /// The lock is held; the caller must block on the returned state.
    Attached(PiStateRef),
}

/// A PI waiter queued on its bucket and on the underlying mutex.
struct Queued {
    waiter: Arc<Waiter>,
    pi_state: PiStateRef,
    rt_waiter: Arc<RtWaiter>,
    acquired: bool,
}

impl PiState {
    /// Creates a state for a lock held by `owner` and links it into the owner's list.
    ///
    /// The caller holds the task-local lock of `owner` and passes its list in.
    fn create(key: Key, owner: &Arc<Task>, owned: &mut Vec<Arc<PiState>>) -> PiStateRef {
        let state = Arc::new(PiState {
            id: PI_STATE_ID.fetch_add(1, Relaxed),
            key,
            refs: AtomicUsize::new(1),
            inner: Mutex::new(PiInner {
                owner: Some(TaskRef::new(owner)),
                rt: RtMutex::owned_by(owner.clone()),
            }),
        });
        owned.push(state.clone());
        trace!("PI state {} created for task {}", state.id, owner.tid());
        PiStateRef(state)
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, PiInner> {
        self.inner.lock()
    }

    /// Takes a reference unless the state is being released.
    pub(crate) fn try_ref(self: &Arc<Self>) -> Option<PiStateRef> {
        self.refs
            .fetch_update(Acquire, Relaxed, |refs| (refs != 0).then_some(refs + 1))
            .ok()
            .map(|_| PiStateRef(self.clone()))
    }

    /// Records `owner` as the owner, moving the state between owners' lists.
    pub(crate) fn set_owner(self: &Arc<Self>, inner: &mut PiInner, owner: Option<&Arc<Task>>) {
        if let Some(previous) = inner.owner.take().and_then(|previous| previous.upgrade()) {
            previous.pi().pi_states.retain(|state| state.id != self.id);
        }
        if let Some(owner) = owner {
            owner.pi().pi_states.push(self.clone());
            inner.owner = Some(TaskRef::new(owner));
        }
    }

    /// Returns `true` if the recorded owner is `task`.
    #[inline]
    pub(crate) fn owned_by(inner: &PiInner, task: &Task) -> bool {
        inner.owner.as_ref().is_some_and(|owner| owner.is(task))
    }

    /// Acquires the underlying mutex for `waiter` if it is free, or queues the waiter on it.
    ///
    /// Donation to the owner is left to a subsequent [`rt_mutex::adjust_prio_chain`].
    pub(crate) fn start_proxy_lock(
        self: &Arc<Self>,
        inner: &mut PiInner,
        waiter: &Arc<RtWaiter>,
    ) -> bool {
        if inner.rt.try_acquire(waiter.task()) {
            waiter.grant();
            return true;
        }
        inner.rt.enqueue(waiter);
        waiter.task().set_blocked_on(Some(self.clone()));
        false
    }

    /// Withdraws `waiter` from the underlying mutex; returns `true` if it was handed the mutex
    /// first.
    pub(crate) fn cancel_proxy_lock(&self, waiter: &Arc<RtWaiter>) -> bool {
        let mut inner = self.lock();
        if waiter.is_acquired() {
            return true;
        }
        inner.rt.remove(waiter);
        waiter.task().set_blocked_on(None);
        false
    }

    /// Passes the underlying mutex to its top waiter, or frees it if nobody waits.
    ///
    /// The previous owner loses the donation received through this lock. The returned waiter
    /// must be woken after the lock of the state is released.
    pub(crate) fn hand_off(&self, inner: &mut PiInner) -> Option<Arc<RtWaiter>> {
        if let Some(previous) = inner.rt.owner() {
            previous.donate(self.id, None);
        }
        let next = inner.rt.hand_off();
        if let Some(next) = &next {
            next.task().set_blocked_on(None);
        }
        next
    }
}

impl fmt::Debug for PiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PiState")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("refs", &self.refs.load(Relaxed))
            .finish_non_exhaustive()
    }
}

impl PiStateRef {
    #[inline]
    pub(crate) fn arc(&self) -> &Arc<PiState> {
        &self.0
    }
}

impl Clone for PiStateRef {
    fn clone(&self) -> Self {
        self.0.refs.fetch_add(1, Relaxed);
        Self(self.0.clone())
    }
}

impl Deref for PiStateRef {
    type Target = PiState;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for PiStateRef {
    fn drop(&mut self) {
        if self.0.refs.fetch_sub(1, AcqRel) != 1 {
            return;
        }
        // Last reference: the lock word alone describes the lock from now on.
        let mut inner = self.0.lock();
        self.0.set_owner(&mut inner, None);
        let next = self.0.hand_off(&mut inner);
        debug_assert!(next.is_none(), "released PI state with queued waiters");
        trace!("PI state {} released", self.0.id);
    }
}

impl fmt::Debug for PiStateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Replaces `old` with `new` in the word at `address`; a concurrent change restarts the caller.
fn update_word(space: &AddressSpace, address: usize, old: u32, new: u32) -> Step<()> {
    if space.compare_exchange(address, old, new)? == old {
        Ok(())
    } else {
        Err(Interim::Retry)
    }
}

/// Checks that the owner recorded in `inner` agrees with the lock word `uval`.
fn validate_owner(inner: &PiInner, uval: u32) -> Result<(), Error> {
    let pid = word::owner(uval);
    let consistent = match (&inner.owner, uval & OWNER_DIED != 0) {
        // Owner died and no one took over yet.
        (None, true) => pid == 0,
        // Owner died and the lock is being handed to a successor.
        (Some(_), true) if pid == 0 => true,
        (None, false) => false,
        (Some(owner), _) => owner.id().get() == pid,
    };
    if consistent {
        Ok(())
    } else {
        warn!("PI state disagrees with lock word {uval:#010x}");
        Err(Error::Corrupted)
    }
}

impl<C: Config> Futex<C> {
    /// Acquires the PI lock at `address` on behalf of `task`, blocking while another task holds
    /// it.
    ///
    /// While blocked, `task` donates its priority to the owner and, transitively, to every owner
    /// further down the chain of locks the owners are blocked on.
    ///
    /// # Errors
    ///
    /// * [`Error::Deadlock`] if `task` already owns the lock or blocking would close a cycle.
    /// * [`Error::OwnerProcessGone`] if the word names a task that no longer exists.
    /// * [`Error::TimedOut`] or [`Error::Interrupted`] if the wait ended without the lock.
    /// * [`Error::Corrupted`] if the word disagrees with the engine's record of the owner.
    /// * [`Error::Fault`] or [`Error::InvalidArgument`] for bad addresses.
    ///
    /// # Examples
    ///
    /// ```
    /// use futex_engine::{AddressSpace, Futex, Priority, Scope};
    ///
    /// let futex = Futex::new();
    /// let space = AddressSpace::new();
    /// let task = futex.tasks().register(space.clone(), Priority::NORMAL);
    /// let lock = space.map_private(4);
    ///
    /// futex.lock_pi(&task, lock, Scope::Private, None).unwrap();
    /// assert_eq!(space.load(lock), Ok(task.tid()));
    /// futex.unlock_pi(&task, lock, Scope::Private).unwrap();
    /// assert_eq!(space.load(lock), Ok(0));
    /// ```
    pub fn lock_pi(
        &self,
        task: &Arc<Task>,
        address: usize,
        scope: Scope,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let queued = retry::bounded(C::retry_limit(), || {
            self.lock_pi_queue(task, address, scope, false)
        })?;
        let Some(Queued {
            waiter,
            pi_state,
            rt_waiter,
            acquired,
        }) = queued
        else {
            return Ok(());
        };
        let result = if acquired {
            Ok(())
        } else {
            rt_mutex::adjust_prio_chain(pi_state.arc(), Some(task), C::lock_depth_limit())
                .and_then(|()| rt_waiter.wait(deadline))
        };
        self.finish_proxy_wait(task, address, &waiter, pi_state, &rt_waiter, result)
    }

    /// Acquires the PI lock at `address` without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WouldBlock`] if the lock is held, and otherwise fails like
    /// [`Futex::lock_pi`].
    pub fn trylock_pi(&self, task: &Arc<Task>, address: usize, scope: Scope) -> Result<(), Error> {
        retry::bounded(C::retry_limit(), || {
            self.lock_pi_queue(task, address, scope, true)
        })
        .map(|_| ())
    }

    /// Releases the PI lock at `address`, handing it to the highest-priority waiter.
    ///
    /// # Errors
    ///
    /// * [`Error::NotOwner`] if the word does not name `task`.
    /// * [`Error::InvalidArgument`] if the waiters are not PI waiters owned by `task`.
    /// * [`Error::Conflict`] if the word kept changing.
    pub fn unlock_pi(&self, task: &Arc<Task>, address: usize, scope: Scope) -> Result<(), Error> {
        retry::bounded(C::retry_limit(), || self.unlock_pi_once(task, address, scope))
    }

    /// One attempt to acquire the word or queue `task` on the lock; `Ok(None)` means acquired.
    fn lock_pi_queue(
        &self,
        task: &Arc<Task>,
        address: usize,
        scope: Scope,
        trylock: bool,
    ) -> Step<Option<Queued>> {
        let space = task.space();
        let key = key::resolve(space, address, scope)?;
        let index = self.table.index_of(&key);
        let bucket = self.table.bucket(index);
        bucket.waiters_inc();
        let mut list = bucket.lock();

        let pi_state = match self.lock_pi_atomic(space, address, &list, &key, task, false) {
            Ok(Acquisition::Attached(pi_state)) => pi_state,
            outcome => {
                drop(list);
                bucket.waiters_dec();
                return outcome.map(|_| None);
            }
        };

        if trylock {
            let mut inner = pi_state.lock();
            let result = if inner.rt.try_acquire(task) {
                Self::fixup_pi_state_owner(space, address, pi_state.arc(), &mut inner, task)
            } else {
                Err(Error::WouldBlock)
            };
            drop(inner);
            drop(list);
            bucket.waiters_dec();
            return result.map(|()| None).map_err(Interim::from);
        }

        let waiter = Waiter::new(task, key, BITSET_MATCH_ANY);
        waiter.state().pi_state = Some(pi_state.clone());
        Self::queue(&mut list, index, &waiter);

        let rt_waiter = RtWaiter::new(task);
        let mut inner = pi_state.lock();
        drop(list);
        let acquired = pi_state.arc().start_proxy_lock(&mut inner, &rt_waiter);
        drop(inner);
        Ok(Some(Queued {
            waiter,
            pi_state,
            rt_waiter,
            acquired,
        }))
    }

    /// Settles a blocked PI wait under the bucket lock: withdraws an unsuccessful waiter, makes
    /// the lock word agree with the outcome, and unqueues the waiter.
    pub(crate) fn finish_proxy_wait(
        &self,
        task: &Arc<Task>,
        address: usize,
        waiter: &Arc<Waiter>,
        pi_state: PiStateRef,
        rt_waiter: &Arc<RtWaiter>,
        mut result: Result<(), Error>,
    ) -> Result<(), Error> {
        let (index, mut list) = self.queue_lock(waiter);
        let mut deboost = None;
        if result.is_err() {
            if pi_state.cancel_proxy_lock(rt_waiter) {
                result = Ok(());
            } else {
                deboost = Some(pi_state.arc().clone());
            }
        }
        match Self::fixup_owner(task.space(), address, &pi_state, task, result.is_ok()) {
            Ok(true) => result = Ok(()),
            Ok(false) => (),
            Err(error) => result = Err(error),
        }
        Self::unqueue_pi(self.table.bucket(index), &mut list, waiter);
        drop(list);
        drop(pi_state);
        if let Some(lock) = deboost {
            // The withdrawn waiter no longer donates to the owner.
            rt_mutex::adjust_prio_chain(&lock, None, C::lock_depth_limit()).ok();
        }
        result
    }

    /// Takes the word at `address` for `task` if it is free, or finds the PI state to block on.
    ///
    /// Called with the bucket lock of `key` held; `list` is that bucket's wait list.
    pub(crate) fn lock_pi_atomic(
        &self,
        space: &AddressSpace,
        address: usize,
        list: &WaitList,
        key: &Key,
        task: &Arc<Task>,
        set_waiters: bool,
    ) -> Step<Acquisition> {
        let uval = space.load(address)?;
        if word::owner(uval) == task.tid() {
            return Err(Error::Deadlock.into());
        }
        if let Some(top) = list.top_waiter(key) {
            let pi_state = top.state().pi_state.clone();
            return Self::attach_to_pi_state(space, address, uval, pi_state)
                .map(Acquisition::Attached);
        }
        if word::owner(uval) == 0 {
            let mut new = (uval & OWNER_DIED) | task.tid();
            if set_waiters {
                new |= WAITERS;
            }
            update_word(space, address, uval, new)?;
            return Ok(Acquisition::Acquired);
        }
        let new = uval | WAITERS;
        update_word(space, address, uval, new)?;
        self.attach_to_pi_owner(space, address, new, key)
            .map(Acquisition::Attached)
    }

    /// Finds the PI state for a word that has waiters, or attaches one to the word's owner.
    pub(crate) fn lookup_pi_state(
        &self,
        space: &AddressSpace,
        address: usize,
        uval: u32,
        list: &WaitList,
        key: &Key,
    ) -> Step<PiStateRef> {
        if let Some(top) = list.top_waiter(key) {
            let pi_state = top.state().pi_state.clone();
            return Self::attach_to_pi_state(space, address, uval, pi_state);
        }
        self.attach_to_pi_owner(space, address, uval, key)
    }

    /// Joins the PI state of an existing waiter after checking it against the word.
    fn attach_to_pi_state(
        space: &AddressSpace,
        address: usize,
        uval: u32,
        pi_state: Option<PiStateRef>,
    ) -> Step<PiStateRef> {
        // Waiters of a PI word are PI waiters.
        let Some(pi_state) = pi_state else {
            return Err(Error::InvalidArgument.into());
        };
        {
            let inner = pi_state.lock();
            if space.load(address)? != uval {
                return Err(Interim::Retry);
            }
            validate_owner(&inner, uval)?;
        }
        Ok(pi_state)
    }

    /// Creates the PI state for a word whose owner has had no waiters so far.
    fn attach_to_pi_owner(
        &self,
        space: &AddressSpace,
        address: usize,
        uval: u32,
        key: &Key,
    ) -> Step<PiStateRef> {
        let pid = word::owner(uval);
        if pid == 0 {
            return Err(Interim::Retry);
        }
        let Some(owner) = self.tasks.by_tid(pid) else {
            return Self::handle_exit_race(space, address, uval, None);
        };
        let mut owner_pi = owner.pi();
        if owner_pi.exit != ExitState::Alive {
            let state = owner_pi.exit;
            drop(owner_pi);
            return Self::handle_exit_race(space, address, uval, Some((owner, state)));
        }
        Ok(PiState::create(*key, &owner, &mut owner_pi.pi_states))
    }

    /// Decides how to proceed when the word names a task that is exiting or gone.
    fn handle_exit_race(
        space: &AddressSpace,
        address: usize,
        uval: u32,
        owner: Option<(Arc<Task>, ExitState)>,
    ) -> Step<PiStateRef> {
        if let Some((owner, ExitState::Exiting)) = owner {
            debug!("lock owner {} is exiting", owner.tid());
            return Err(Interim::OwnerExiting(owner));
        }
        // The owner finished cleanup; if it released the word meanwhile, start over.
        if space.load(address)? != uval {
            return Err(Interim::Retry);
        }
        debug!("lock word {uval:#010x} at {address:#x} names a task that is gone");
        Err(Error::OwnerProcessGone.into())
    }

    /// Makes the word agree with the outcome of a PI wait.
    ///
    /// Returns `true` if `task` owns the lock.
    pub(crate) fn fixup_owner(
        space: &AddressSpace,
        address: usize,
        pi_state: &PiStateRef,
        task: &Arc<Task>,
        locked: bool,
    ) -> Result<bool, Error> {
        let mut inner = pi_state.lock();
        if locked {
            if !PiState::owned_by(&inner, task) {
                Self::fixup_pi_state_owner(space, address, pi_state.arc(), &mut inner, task)?;
            }
            return Ok(true);
        }
        if PiState::owned_by(&inner, task) {
            // The word was handed to `task`, but the underlying mutex went elsewhere or is free.
            if inner.rt.try_acquire(task) {
                return Ok(true);
            }
            let Some(rt_owner) = inner.rt.owner().cloned() else {
                return Err(Error::Corrupted);
            };
            Self::fixup_pi_state_owner(space, address, pi_state.arc(), &mut inner, &rt_owner)?;
        }
        Ok(false)
    }

    /// Rewrites the owner field of the word to `new_owner`, keeping `OWNER_DIED`.
    fn fixup_pi_state_owner(
        space: &AddressSpace,
        address: usize,
        pi_state: &Arc<PiState>,
        inner: &mut PiInner,
        new_owner: &Arc<Task>,
    ) -> Result<(), Error> {
        let mut new_tid = new_owner.tid() | WAITERS;
        if inner.owner.is_none() {
            new_tid |= OWNER_DIED;
        }
        match Self::rewrite_owner(space, address, new_tid) {
            Ok(()) => {
                pi_state.set_owner(inner, Some(new_owner));
                Ok(())
            }
            Err(error) => {
                // Keep the record consistent with the underlying mutex.
                let rt_owner = inner.rt.owner().cloned();
                pi_state.set_owner(inner, rt_owner.as_ref());
                Err(error)
            }
        }
    }

    fn rewrite_owner(space: &AddressSpace, address: usize, new_tid: u32) -> Result<(), Error> {
        let mut uval = space.load(address)?;
        for _ in 0..C::retry_limit() {
            let new = (uval & OWNER_DIED) | new_tid;
            let current = space.compare_exchange(address, uval, new)?;
            if current == uval {
                return Ok(());
            }
            uval = current;
        }
        Err(Error::Conflict)
    }

    fn unlock_pi_once(&self, task: &Arc<Task>, address: usize, scope: Scope) -> Step<()> {
        let space = task.space();
        let uval = space.load(address)?;
        if word::owner(uval) != task.tid() {
            return Err(Error::NotOwner.into());
        }
        let key = key::resolve(space, address, scope)?;
        let list = self.table.bucket(self.table.index_of(&key)).lock();

        let Some(top) = list.top_waiter(&key) else {
            // No waiters: release the word, which may still carry stale flags.
            drop(list);
            return update_word(space, address, uval, 0);
        };
        let Some(pi_state) = top.state().pi_state.clone() else {
            return Err(Error::InvalidArgument.into());
        };
        let inner = pi_state.lock();
        if !PiState::owned_by(&inner, task) {
            return Err(Error::InvalidArgument.into());
        }
        drop(list);
        Self::wake_pi(space, address, uval, &pi_state, inner)
    }

    /// Hands the lock to the top waiter of the underlying mutex and rewrites the word for it.
    fn wake_pi(
        space: &AddressSpace,
        address: usize,
        uval: u32,
        pi_state: &PiStateRef,
        mut inner: MutexGuard<'_, PiInner>,
    ) -> Step<()> {
        // A waiter that timed out may still be queued on its bucket; let it leave.
        let Some(next) = inner.rt.top_waiter().cloned() else {
            return Err(Interim::Retry);
        };
        // The word keeps WAITERS for as long as the PI state exists.
        let new = next.task().tid() | WAITERS;
        update_word(space, address, uval, new)?;

        pi_state.arc().set_owner(&mut inner, Some(next.task()));
        let handed = pi_state.hand_off(&mut inner);
        drop(inner);
        if let Some(handed) = handed {
            trace!("PI lock at {address:#x} handed to task {}", handed.task().tid());
            handed.wake();
        }
        rt_mutex::adjust_prio_chain(pi_state.arc(), None, C::lock_depth_limit()).ok();
        Ok(())
    }
}
