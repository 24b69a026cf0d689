//! Wait queue entries.
//!
//! A [`Waiter`] represents one blocked call. It is linked into exactly one bucket while queued; the
//! bucket index and the key it records are updated only under the bucket lock, which lets a waiter
//! that has been requeued find its current bucket.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::task::{Context, Poll, Waker};
use std::thread::{self, Thread};

use crate::key::Key;
use crate::lock_api::{Mutex, MutexGuard};
use crate::pi::PiStateRef;
use crate::rt_mutex::RtWaiter;
use crate::task::{Priority, Task, TaskRef};

/// Wait queue entry.
pub(crate) struct Waiter {
    /// The blocked task.
    task: TaskRef,
    /// Effective priority of the task when it was queued.
    priority: Priority,
    /// Wake bitset.
    bitset: u32,
    /// Set once a waker removed the entry from its bucket.
    woken: AtomicBool,
    /// Monitors the wake-up.
    monitor: Monitor,
    /// Queue linkage and PI attachments; a leaf lock.
    state: Mutex<WaiterState>,
}

/// Mutable part of a [`Waiter`].
pub(crate) struct WaiterState {
    /// Key the entry waits on.
    pub(crate) key: Key,
    /// Index of the bucket the entry is, or was last, linked into.
    pub(crate) bucket: usize,
    /// The entry is linked into `bucket`.
    pub(crate) queued: bool,
    /// PI state of a PI waiter.
    pub(crate) pi_state: Option<PiStateRef>,
    /// Underlying-mutex waiter of a requeue-PI waiter; taken when the lock is handed over during
    /// the requeue itself.
    pub(crate) rt_waiter: Option<Arc<RtWaiter>>,
    /// The only key a requeue-PI waiter may be moved to.
    pub(crate) requeue_pi_key: Option<Key>,
}

/// Monitors the wake-up.
enum Monitor {
    /// Monitors asynchronously.
    Async(Mutex<Option<Waker>>),
    /// Monitors synchronously.
    Sync(Thread),
}

/// Completes once the [`Waiter`] has been woken.
pub(crate) struct Woken<'w>(pub(crate) &'w Waiter);

impl Waiter {
    /// Creates an entry for a thread blocking synchronously.
    pub(crate) fn new(task: &Arc<Task>, key: Key, bitset: u32) -> Arc<Self> {
        Self::with_monitor(task, key, bitset, Monitor::Sync(thread::current()))
    }

    /// Creates an entry awaited by a future.
    pub(crate) fn new_async(task: &Arc<Task>, key: Key, bitset: u32) -> Arc<Self> {
        Self::with_monitor(task, key, bitset, Monitor::Async(Mutex::new(None)))
    }

    /// Creates the entry of a requeue-PI wait.
    pub(crate) fn new_requeue_pi(
        task: &Arc<Task>,
        key: Key,
        bitset: u32,
        target: Key,
        rt_waiter: Arc<RtWaiter>,
    ) -> Arc<Self> {
        let waiter = Self::new(task, key, bitset);
        {
            let mut state = waiter.state();
            state.requeue_pi_key = Some(target);
            state.rt_waiter = Some(rt_waiter);
        }
        waiter
    }

    fn with_monitor(task: &Arc<Task>, key: Key, bitset: u32, monitor: Monitor) -> Arc<Self> {
        Arc::new(Self {
            task: TaskRef::new(task),
            priority: task.priority(),
            bitset,
            woken: AtomicBool::new(false),
            monitor,
            state: Mutex::new(WaiterState {
                key,
                bucket: 0,
                queued: false,
                pi_state: None,
                rt_waiter: None,
                requeue_pi_key: None,
            }),
        })
    }

    #[inline]
    pub(crate) fn task(&self) -> &TaskRef {
        &self.task
    }

    #[inline]
    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub(crate) fn bitset(&self) -> u32 {
        self.bitset
    }

    #[inline]
    pub(crate) fn state(&self) -> MutexGuard<'_, WaiterState> {
        self.state.lock()
    }

    /// Returns `true` if the entry's key equals `key`.
    #[inline]
    pub(crate) fn waits_on(&self, key: &Key) -> bool {
        self.state().key == *key
    }

    #[inline]
    pub(crate) fn is_woken(&self) -> bool {
        self.woken.load(Acquire)
    }

    /// Wakes the blocked call; must be called after the entry left its bucket and the bucket lock
    /// was released.
    pub(crate) fn wake(&self) {
        self.woken.store(true, Release);
        match &self.monitor {
            Monitor::Async(waker) => {
                if let Some(waker) = waker.lock().take() {
                    waker.wake();
                }
            }
            Monitor::Sync(thread) => thread.unpark(),
        }
    }

    fn poll_woken(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_woken() {
            return Poll::Ready(());
        }
        if let Monitor::Async(waker) = &self.monitor {
            waker.lock().replace(cx.waker().clone());
        }
        if self.is_woken() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("task", &self.task.id())
            .field("priority", &self.priority)
            .field("bitset", &self.bitset)
            .field("woken", &self.is_woken())
            .finish_non_exhaustive()
    }
}

impl Future for Woken<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_woken(cx)
    }
}
