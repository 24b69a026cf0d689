//! The priority-aware mutex underlying every PI state.
//!
//! [`RtMutex`] has no lock of its own; it is only touched under the lock of the
//! [`PiState`](crate::pi::PiState) embedding it. Releasing it hands ownership directly to the
//! highest-priority waiter, so a woken waiter already owns the mutex and never competes again.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::thread::{self, Thread};
use std::time::Instant;

use crate::error::Error;
use crate::pi::PiState;
use crate::task::{Priority, Task, Wakeup};

/// A task blocked on an [`RtMutex`].
pub(crate) struct RtWaiter {
    /// The blocked task.
    task: Arc<Task>,
    /// Thread to unpark on hand-off.
    thread: Thread,
    /// Set when ownership was handed to the waiter.
    acquired: AtomicBool,
}

/// Owner and priority-ordered waiters.
#[derive(Debug, Default)]
pub(crate) struct RtMutex {
    owner: Option<Arc<Task>>,
    waiters: Vec<(Priority, Arc<RtWaiter>)>,
}

impl RtWaiter {
    /// Creates a waiter for `task` blocking on the calling thread.
    pub(crate) fn new(task: &Arc<Task>) -> Arc<Self> {
        Arc::new(Self {
            task: task.clone(),
            thread: thread::current(),
            acquired: AtomicBool::new(false),
        })
    }

    #[inline]
    pub(crate) fn task(&self) -> &Arc<Task> {
        &self.task
    }

    #[inline]
    pub(crate) fn is_acquired(&self) -> bool {
        self.acquired.load(Acquire)
    }

    #[inline]
    pub(crate) fn grant(&self) {
        self.acquired.store(true, Release);
    }

    /// Unparks the waiter; call after releasing the PI state lock.
    #[inline]
    pub(crate) fn wake(&self) {
        self.thread.unpark();
    }

    /// Blocks until ownership is handed over.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> Result<(), Error> {
        match self.task.block_until(deadline, || self.is_acquired()) {
            Wakeup::Ready => Ok(()),
            Wakeup::TimedOut => Err(Error::TimedOut),
            Wakeup::Interrupted => Err(Error::Interrupted),
        }
    }
}

impl fmt::Debug for RtWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtWaiter")
            .field("task", &self.task.id())
            .field("acquired", &self.is_acquired())
            .finish()
    }
}

impl RtMutex {
    /// Creates a mutex owned by `owner`.
    pub(crate) fn owned_by(owner: Arc<Task>) -> Self {
        Self {
            owner: Some(owner),
            waiters: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn owner(&self) -> Option<&Arc<Task>> {
        self.owner.as_ref()
    }

    #[inline]
    pub(crate) fn top_waiter(&self) -> Option<&Arc<RtWaiter>> {
        self.waiters.first().map(|(_, waiter)| waiter)
    }

    #[inline]
    pub(crate) fn top_priority(&self) -> Option<Priority> {
        self.waiters.first().map(|(priority, _)| *priority)
    }

    /// Takes the mutex if it is free and no waiter outranks `task`.
    pub(crate) fn try_acquire(&mut self, task: &Arc<Task>) -> bool {
        if self.owner.is_some() || self.top_priority() >= Some(task.priority()) {
            return false;
        }
        self.owner = Some(task.clone());
        true
    }

    /// Queues `waiter` behind waiters of equal or higher priority.
    pub(crate) fn enqueue(&mut self, waiter: &Arc<RtWaiter>) {
        let priority = waiter.task.priority();
        let position = self
            .waiters
            .iter()
            .position(|(queued, _)| *queued < priority)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(position, (priority, waiter.clone()));
    }

    pub(crate) fn remove(&mut self, waiter: &Arc<RtWaiter>) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|(_, queued)| !Arc::ptr_eq(queued, waiter));
        before != self.waiters.len()
    }

    /// Moves the waiter of `task` to the position its current priority calls for.
    pub(crate) fn reposition(&mut self, task: &Task) {
        if let Some(index) = self
            .waiters
            .iter()
            .position(|(_, waiter)| waiter.task.id() == task.id())
        {
            let (_, waiter) = self.waiters.remove(index);
            self.enqueue(&waiter);
        }
    }

    /// Releases the mutex to the top waiter, or leaves it free if nobody waits.
    pub(crate) fn hand_off(&mut self) -> Option<Arc<RtWaiter>> {
        if self.waiters.is_empty() {
            self.owner = None;
            return None;
        }
        let (_, next) = self.waiters.remove(0);
        self.owner = Some(next.task.clone());
        next.grant();
        Some(next)
    }
}

/// Propagates priority donations from `lock` to its owner and onward along the chain of locks
/// the owners are blocked on.
///
/// When `origin` is given, the walk runs to the end of the chain and fails with
/// [`Error::Deadlock`] if it leads back to `origin`. Otherwise it stops at the first owner whose
/// priority does not change.
pub(crate) fn adjust_prio_chain(
    lock: &Arc<PiState>,
    origin: Option<&Arc<Task>>,
    depth_limit: usize,
) -> Result<(), Error> {
    let mut lock = lock.clone();
    for depth in 0..depth_limit {
        let (owner, next) = {
            let inner = lock.lock();
            let Some(owner) = inner.rt.owner().cloned() else {
                return Ok(());
            };
            if origin.is_some_and(|origin| Arc::ptr_eq(origin, &owner)) {
                // At depth 0 the origin was handed the lock in the meantime.
                return if depth == 0 {
                    Ok(())
                } else {
                    Err(Error::Deadlock)
                };
            }
            let (changed, blocked_on) = owner.donate(lock.id(), inner.rt.top_priority());
            match blocked_on {
                Some(next) if changed || origin.is_some() => (owner, next),
                _ => return Ok(()),
            }
        };
        next.lock().rt.reposition(&owner);
        lock = next;
    }
    Ok(())
}
