//! Tasks, the [`TaskRegistry`] that resolves task ids, and per-task priority-inheritance state.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::Instant;

use crate::lock_api::{Mutex, MutexGuard, RwLock};
use crate::memory::AddressSpace;
use crate::pi::PiState;
use crate::word::TID_MASK;

/// Identity of a [`Task`]; the value stored in the owner field of a lock word.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskId(u32);

/// Scheduling priority; a higher value is more urgent.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Priority(pub u8);

/// Lifecycle of a task with respect to futex cleanup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitState {
    /// The task runs normally.
    Alive,
    /// The task is releasing its robust list and owned PI states; new PI attachments wait.
    Exiting,
    /// Cleanup finished.
    Dead,
}

/// A thread of execution known to the engine.
pub struct Task {
    /// Task id.
    id: TaskId,
    /// Address space the task runs in.
    space: Arc<AddressSpace>,
    /// Priority set at creation.
    base_priority: Priority,
    /// Base priority raised by donations from PI waiters.
    priority: AtomicU8,
    /// Thread the task last blocked on; the registering thread until then.
    thread: Mutex<Thread>,
    /// Pending interruption.
    interrupted: AtomicBool,
    /// Registered robust-list head; `0` when none.
    robust_list: AtomicUsize,
    /// Priority-inheritance bookkeeping.
    pi: Mutex<TaskPi>,
    /// Held for the whole exit cleanup.
    exit_lock: Mutex<()>,
}

/// Priority-inheritance bookkeeping of a task, guarded by the task-local lock.
#[derive(Debug)]
pub(crate) struct TaskPi {
    /// Exit state.
    pub(crate) exit: ExitState,
    /// Priority donated through each owned lock, by PI state id.
    pub(crate) donations: Vec<(u64, Priority)>,
    /// The PI lock the task is blocked on.
    pub(crate) blocked_on: Option<Arc<PiState>>,
    /// PI states the task owns.
    pub(crate) pi_states: Vec<Arc<PiState>>,
}

/// Non-owning task handle resolved on demand.
#[derive(Clone, Debug)]
pub(crate) struct TaskRef {
    id: TaskId,
    task: Weak<Task>,
}

/// How a blocked task resumed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Wakeup {
    /// The condition became true.
    Ready,
    /// The deadline passed.
    TimedOut,
    /// [`Task::interrupt`] was called.
    Interrupted,
}

/// [`TaskRegistry`] resolves task ids stored in lock words into live tasks.
#[derive(Default)]
pub struct TaskRegistry {
    /// Registered tasks.
    tasks: RwLock<HashMap<TaskId, Arc<Task>>>,
    /// Task id allocator.
    next_id: AtomicU32,
}

impl TaskId {
    /// Converts the owner field of a lock word into a [`TaskId`].
    ///
    /// Returns `None` for `0` and values outside the owner mask.
    #[inline]
    #[must_use]
    pub const fn new(tid: u32) -> Option<Self> {
        if tid == 0 || tid > TID_MASK {
            None
        } else {
            Some(Self(tid))
        }
    }

    /// Returns the raw task id.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl Priority {
    /// Least urgent priority.
    pub const IDLE: Self = Self(0);

    /// Priority of ordinary tasks.
    pub const NORMAL: Self = Self(50);

    /// Most urgent priority.
    pub const HIGHEST: Self = Self(u8::MAX);
}

impl Task {
    /// Returns the task id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the raw task id as written into lock words.
    #[inline]
    #[must_use]
    pub fn tid(&self) -> u32 {
        self.id.0
    }

    /// Returns the address space of the task.
    #[inline]
    #[must_use]
    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// Returns the priority the task was created with.
    #[inline]
    #[must_use]
    pub fn base_priority(&self) -> Priority {
        self.base_priority
    }

    /// Returns the effective priority including inherited donations.
    #[inline]
    #[must_use]
    pub fn priority(&self) -> Priority {
        Priority(self.priority.load(Acquire))
    }

    /// Returns the exit state.
    #[must_use]
    pub fn exit_state(&self) -> ExitState {
        self.pi.lock().exit
    }

    /// Returns the registered robust-list head.
    #[inline]
    #[must_use]
    pub fn robust_list(&self) -> Option<usize> {
        let head = self.robust_list.load(Acquire);
        (head != 0).then_some(head)
    }

    /// Interrupts the task.
    ///
    /// A blocking futex call the task is in, or the next one it makes, returns
    /// [`Error::Interrupted`](crate::Error::Interrupted).
    pub fn interrupt(&self) {
        self.interrupted.store(true, Release);
        self.thread.lock().unpark();
    }

    /// Blocks the calling thread until `ready` returns `true`, the deadline passes, or the task
    /// is interrupted.
    ///
    /// The calling thread becomes the one [`Task::interrupt`] unparks.
    pub(crate) fn block_until<F: FnMut() -> bool>(
        &self,
        deadline: Option<Instant>,
        mut ready: F,
    ) -> Wakeup {
        *self.thread.lock() = thread::current();
        loop {
            if ready() {
                return Wakeup::Ready;
            }
            if self.interrupted.swap(false, AcqRel) {
                return Wakeup::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Wakeup::TimedOut;
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
    }

    pub(crate) fn set_robust_list(&self, head: usize) {
        self.robust_list.store(head, Release);
    }

    pub(crate) fn pi(&self) -> MutexGuard<'_, TaskPi> {
        self.pi.lock()
    }

    /// Blocks until a concurrent exit cleanup of the task has finished.
    pub(crate) fn wait_for_exit(&self) {
        drop(self.exit_lock.lock());
    }

    /// Starts the exit cleanup, returning `None` if it already ran.
    ///
    /// The returned guard keeps PI attachers waiting until cleanup finishes.
    pub(crate) fn begin_exit(&self) -> Option<MutexGuard<'_, ()>> {
        let guard = self.exit_lock.lock();
        let mut pi = self.pi.lock();
        if pi.exit != ExitState::Alive {
            return None;
        }
        pi.exit = ExitState::Exiting;
        drop(pi);
        Some(guard)
    }

    pub(crate) fn set_exit_state(&self, state: ExitState) {
        self.pi.lock().exit = state;
    }

    /// Replaces the donation received through the PI state `lock`.
    ///
    /// Returns whether the effective priority changed, and the lock the task is blocked on.
    pub(crate) fn donate(
        &self,
        lock: u64,
        priority: Option<Priority>,
    ) -> (bool, Option<Arc<PiState>>) {
        let mut pi = self.pi.lock();
        pi.donations.retain(|(id, _)| *id != lock);
        if let Some(priority) = priority {
            pi.donations.push((lock, priority));
        }
        let effective = pi
            .donations
            .iter()
            .map(|(_, priority)| *priority)
            .fold(self.base_priority, Ord::max);
        let previous = self.priority.swap(effective.0, AcqRel);
        (previous != effective.0, pi.blocked_on.clone())
    }

    pub(crate) fn set_blocked_on(&self, lock: Option<Arc<PiState>>) {
        self.pi.lock().blocked_on = lock;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("space", &self.space.id())
            .field("base_priority", &self.base_priority)
            .field("priority", &self.priority())
            .finish_non_exhaustive()
    }
}

impl TaskRef {
    pub(crate) fn new(task: &Arc<Task>) -> Self {
        Self {
            id: task.id,
            task: Arc::downgrade(task),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<Task>> {
        self.task.upgrade()
    }

    pub(crate) fn is(&self, task: &Task) -> bool {
        self.id == task.id
    }
}

impl TaskRegistry {
    /// Registers a task running on the calling thread.
    ///
    /// # Examples
    ///
    /// ```
    /// use futex_engine::{AddressSpace, Priority, TaskRegistry};
    ///
    /// let registry = TaskRegistry::default();
    /// let task = registry.register(AddressSpace::new(), Priority::NORMAL);
    /// assert!(registry.get(task.id()).is_some());
    /// ```
    #[must_use]
    pub fn register(&self, space: Arc<AddressSpace>, priority: Priority) -> Arc<Task> {
        let id = TaskId(self.next_id.fetch_add(1, Relaxed) % TID_MASK + 1);
        let task = Arc::new(Task {
            id,
            space,
            base_priority: priority,
            priority: AtomicU8::new(priority.0),
            thread: Mutex::new(thread::current()),
            interrupted: AtomicBool::new(false),
            robust_list: AtomicUsize::new(0),
            pi: Mutex::new(TaskPi {
                exit: ExitState::Alive,
                donations: Vec::new(),
                blocked_on: None,
                pi_states: Vec::new(),
            }),
            exit_lock: Mutex::new(()),
        });
        self.tasks.write().insert(id, task.clone());
        task
    }

    /// Returns the live task with the given id.
    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.read().get(&id).cloned()
    }

    /// Returns the number of registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Returns `true` if no task is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    pub(crate) fn by_tid(&self, tid: u32) -> Option<Arc<Task>> {
        self.get(TaskId::new(tid)?)
    }

    pub(crate) fn remove(&self, id: TaskId) {
        self.tasks.write().remove(&id);
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.len())
            .finish()
    }
}
