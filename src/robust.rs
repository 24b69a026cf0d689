//! Robust lists and exit cleanup.
//!
//! A task registers the head of a list, in its own memory, of the locks it holds. When the task
//! exits, the engine walks the list, marks each lock word still naming the task with
//! [`OWNER_DIED`](crate::WordFlags::OWNER_DIED), and wakes a waiter so that the lock can be
//! recovered. PI states the task still owns are then handed to their top waiters.
//!
//! The head has three 8-byte fields: the address of the first entry (the head itself when the
//! list is empty), the signed offset from an entry to its lock word, and the address of an entry
//! whose lock operation is in flight. Bit 0 of an entry address marks a PI lock.

use std::sync::Arc;
use std::thread::yield_now;

use log::{debug, warn};

use crate::config::Config;
use crate::error::Error;
use crate::futex::Futex;
use crate::key::{self, Scope};
use crate::memory::AddressSpace;
use crate::pi::PiState;
use crate::rt_mutex;
use crate::task::{ExitState, Task, TaskId};
use crate::word::{self, BITSET_MATCH_ANY, OWNER_DIED, WAITERS};

/// Size of a robust-list head.
pub const ROBUST_LIST_HEAD_SIZE: usize = 24;

/// Offset of the lock-word offset field in the head.
pub(crate) const FUTEX_OFFSET_FIELD: usize = 8;

/// Offset of the pending-entry field in the head.
pub(crate) const PENDING_FIELD: usize = 16;

/// Marks an entry that guards a PI lock.
pub(crate) const PI_ENTRY: u64 = 1;

/// Reads the entry pointer at `address`, splitting off the PI mark.
fn fetch_entry(space: &AddressSpace, address: usize) -> Result<(usize, bool), Error> {
    let raw = space.load_u64(address)?;
    let entry = usize::try_from(raw & !PI_ENTRY).map_err(|_| Error::Fault)?;
    Ok((entry, raw & PI_ENTRY != 0))
}

/// Converts an address into the representation stored in user memory.
pub(crate) fn pointer(address: usize) -> Result<u64, Error> {
    u64::try_from(address).map_err(|_| Error::InvalidArgument)
}

impl<C: Config> Futex<C> {
    /// Registers the robust-list head of `task` at `head`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `len` is not [`ROBUST_LIST_HEAD_SIZE`].
    pub fn register_lock_list(
        &self,
        task: &Arc<Task>,
        head: usize,
        len: usize,
    ) -> Result<(), Error> {
        if len != ROBUST_LIST_HEAD_SIZE {
            return Err(Error::InvalidArgument);
        }
        task.set_robust_list(head);
        Ok(())
    }

    /// Returns the robust-list head registered by the task `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OwnerProcessGone`] if no such task is registered.
    pub fn robust_list(&self, id: TaskId) -> Result<Option<usize>, Error> {
        self.tasks
            .get(id)
            .map(|task| task.robust_list())
            .ok_or(Error::OwnerProcessGone)
    }

    /// Records `entry` as the lock `task` is about to take or release, so that exit cleanup
    /// covers it even though it is not linked into the list yet.
    ///
    /// Passing `None` clears the record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `task` has no robust list, and [`Error::Fault`] if
    /// the head is not mapped.
    pub fn register_pending(
        &self,
        task: &Arc<Task>,
        entry: Option<(usize, bool)>,
    ) -> Result<(), Error> {
        let head = task.robust_list().ok_or(Error::InvalidArgument)?;
        let value = match entry {
            Some((entry, pi)) => pointer(entry)? | if pi { PI_ENTRY } else { 0 },
            None => 0,
        };
        task.space().store_u64(head + PENDING_FIELD, value)
    }

    /// Releases everything `task` holds and unregisters it.
    ///
    /// Lock words on the robust list that still name `task` get `OWNER_DIED`, and one waiter of
    /// each non-PI word is woken. PI locks owned by `task` are handed to their top waiters. Tasks
    /// trying to attach to a PI lock of `task` meanwhile wait until cleanup finishes and then see
    /// the outcome. Calling `exit` twice is harmless.
    pub fn exit(&self, task: &Arc<Task>) {
        let Some(guard) = task.begin_exit() else {
            debug!("task {} already exited", task.tid());
            return;
        };
        debug!("task {} exiting", task.tid());
        self.release_task(task);
        task.set_exit_state(ExitState::Dead);
        drop(guard);
        self.tasks.remove(task.id());
    }

    /// Runs the exit cleanup for a task that replaces its program image and keeps running.
    ///
    /// The robust-list registration is dropped along with the old image.
    pub fn exec(&self, task: &Arc<Task>) {
        let Some(guard) = task.begin_exit() else {
            return;
        };
        self.release_task(task);
        task.set_robust_list(0);
        task.set_exit_state(ExitState::Alive);
        drop(guard);
    }

    fn release_task(&self, task: &Arc<Task>) {
        self.exit_robust_list(task);
        self.exit_pi_state_list(task);
    }

    fn exit_robust_list(&self, task: &Arc<Task>) {
        let Some(head) = task.robust_list() else {
            return;
        };
        let space = task.space();
        let header = fetch_entry(space, head).and_then(|first| {
            let raw = space.load_u64(head + FUTEX_OFFSET_FIELD)?;
            let offset = isize::try_from(i64::from_ne_bytes(raw.to_ne_bytes()))
                .map_err(|_| Error::Fault)?;
            let pending = fetch_entry(space, head + PENDING_FIELD)?;
            Ok((first, offset, pending))
        });
        let Ok(((mut entry, mut pi), offset, (pending, pending_pi))) = header else {
            debug!("robust list head of task {} is unreadable", task.tid());
            return;
        };

        let mut remaining = C::robust_list_limit();
        while entry != head {
            // Fetch the successor first; handling the entry may let another task free it.
            let next = fetch_entry(space, entry);
            if entry != pending {
                let address = entry.wrapping_add_signed(offset);
                if let Err(error) = self.handle_futex_death(task, address, pi, false) {
                    debug!("robust list of task {} stopped at {entry:#x}: {error}", task.tid());
                    return;
                }
            }
            let Ok((next_entry, next_pi)) = next else {
                debug!("robust list of task {} is broken after {entry:#x}", task.tid());
                return;
            };
            (entry, pi) = (next_entry, next_pi);
            remaining = remaining.saturating_sub(1);
            if remaining == 0 {
                let limit = C::robust_list_limit();
                warn!("robust list of task {} exceeds {limit} entries", task.tid());
                break;
            }
        }

        if pending != 0 {
            let address = pending.wrapping_add_signed(offset);
            if let Err(error) = self.handle_futex_death(task, address, pending_pi, true) {
                debug!("pending robust entry of task {} not handled: {error}", task.tid());
            }
        }
    }

    /// Marks the lock word at `address` as abandoned by `task` and wakes one waiter.
    fn handle_futex_death(
        &self,
        task: &Arc<Task>,
        address: usize,
        pi: bool,
        pending: bool,
    ) -> Result<(), Error> {
        if address % align_of::<u32>() != 0 {
            return Err(Error::InvalidArgument);
        }
        let space = task.space();
        for _ in 0..C::retry_limit() {
            let uval = space.load(address)?;
            // Died between announcing and taking the lock: the lock is free, but a waiter may
            // have been chosen to take it and must not sleep forever.
            if pending && !pi && uval == 0 {
                self.wake_robust(space, address);
                return Ok(());
            }
            if word::owner(uval) != task.tid() {
                return Ok(());
            }
            let marked = (uval & WAITERS) | OWNER_DIED;
            if space.compare_exchange(address, uval, marked)? != uval {
                continue;
            }
            // PI waiters are handed the lock when the PI states are released.
            if !pi && uval & WAITERS != 0 {
                self.wake_robust(space, address);
            }
            return Ok(());
        }
        Err(Error::Conflict)
    }

    fn wake_robust(&self, space: &AddressSpace, address: usize) {
        if let Ok(key) = key::resolve(space, address, Scope::Shared) {
            if let Err(error) = self.wake_key(&key, 1, BITSET_MATCH_ANY) {
                debug!("robust wake-up at {address:#x} failed: {error}");
            }
        }
    }

    /// Hands every PI lock still owned by `task` to its top waiter.
    fn exit_pi_state_list(&self, task: &Arc<Task>) {
        loop {
            let Some(next) = task.pi().pi_states.first().cloned() else {
                break;
            };
            let Some(pi_state) = next.try_ref() else {
                // Being released concurrently; the release detaches it from its owner.
                let owned = PiState::owned_by(&next.lock(), task);
                if owned {
                    yield_now();
                } else {
                    task.pi().pi_states.retain(|state| !Arc::ptr_eq(state, &next));
                }
                continue;
            };
            let handed = {
                let mut inner = pi_state.lock();
                if PiState::owned_by(&inner, task) {
                    pi_state.arc().set_owner(&mut inner, None);
                    pi_state.hand_off(&mut inner)
                } else {
                    task.pi().pi_states.retain(|state| !Arc::ptr_eq(state, &next));
                    None
                }
            };
            if let Some(handed) = handed {
                let heir = handed.task().tid();
                debug!("task {heir} inherits a PI lock from exiting task {}", task.tid());
                handed.wake();
                rt_mutex::adjust_prio_chain(pi_state.arc(), None, C::lock_depth_limit()).ok();
            }
        }
    }
}
