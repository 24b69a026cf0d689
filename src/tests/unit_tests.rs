use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::key::{self, Key, Scope};
use crate::opcode::{ArithOp, Comparison, WakeOp};
use crate::user::{PiMutex, RobustList};
use crate::word::{self, OWNER_DIED, WAITERS};
use crate::{
    AddressSpace, BITSET_MATCH_ANY, Error, ExitState, Futex, MemoryObject, PAGE_SIZE, Priority,
    Requeue, Task,
};

/// Gives up on a condition that should hold shortly.
fn eventually<F: FnMut() -> bool>(mut condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::yield_now();
    }
}

/// Number of waiters linked on the word at `address`.
fn queued(futex: &Futex, space: &AddressSpace, address: usize, scope: Scope) -> usize {
    let key = key::resolve(space, address, scope).unwrap();
    queued_on(futex, &key)
}

fn queued_on(futex: &Futex, key: &Key) -> usize {
    let index = futex.table.index_of(key);
    futex.table.bucket(index).lock().matching(key).len()
}

/// Spawns a thread registering its own task in `space`.
fn spawn_task<T: Send + 'static, F: FnOnce(Arc<Task>) -> T + Send + 'static>(
    futex: &Arc<Futex>,
    space: &Arc<AddressSpace>,
    priority: Priority,
    body: F,
) -> (Arc<Task>, thread::JoinHandle<T>) {
    let (sender, receiver) = mpsc::channel();
    let futex = futex.clone();
    let space = space.clone();
    let handle = thread::spawn(move || {
        let task = futex.tasks().register(space, priority);
        sender.send(task.clone()).unwrap();
        body(task)
    });
    (receiver.recv().unwrap(), handle)
}

mod wait_wake {
    use super::*;

    #[test]
    fn mismatch_and_empty_wake() {
        let futex = Futex::new();
        let space = AddressSpace::new();
        let task = futex.tasks().register(space.clone(), Priority::NORMAL);
        let word = space.map_private(4);
        space.store(word, 5).unwrap();

        let result = futex.wait(&task, word, Scope::Private, 4, BITSET_MATCH_ANY, None);
        assert_eq!(result, Err(Error::ValueMismatch));
        assert_eq!(futex.wake(&task, word, Scope::Private, 1, BITSET_MATCH_ANY), Ok(0));
        assert_eq!(
            futex.wait(&task, word, Scope::Private, 5, 0, None),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            futex.wait(&task, word + 2, Scope::Private, 5, BITSET_MATCH_ANY, None),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            futex.wait(&task, 0x10, Scope::Shared, 0, BITSET_MATCH_ANY, None),
            Err(Error::Fault)
        );
    }

    #[test]
    fn timeout_leaves_nothing_queued() {
        let futex = Futex::new();
        let space = AddressSpace::new();
        let task = futex.tasks().register(space.clone(), Priority::NORMAL);
        let word = space.map_private(4);

        let started = Instant::now();
        let result = futex.wait(
            &task,
            word,
            Scope::Private,
            0,
            BITSET_MATCH_ANY,
            Some(Duration::from_millis(20)),
        );
        assert_eq!(result, Err(Error::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(20));

        let key = key::resolve(&space, word, Scope::Private).unwrap();
        assert_eq!(queued_on(&futex, &key), 0);
        assert_eq!(futex.table.bucket(futex.table.index_of(&key)).pending(), 0);
    }

    #[test]
    fn interrupt_ends_wait() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let word = space.map_private(4);

        let (task, handle) = spawn_task(&futex, &space, Priority::NORMAL, {
            let futex = futex.clone();
            move |task| futex.wait(&task, word, Scope::Private, 0, BITSET_MATCH_ANY, None)
        });
        task.interrupt();
        assert_eq!(handle.join().unwrap(), Err(Error::Interrupted));
        assert_eq!(queued(&futex, &space, word, Scope::Private), 0);
    }

    #[test]
    fn interrupt_reaches_task_blocked_on_another_thread() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let word = space.map_private(4);
        let task = futex.tasks().register(space.clone(), Priority::NORMAL);

        let futex_clone = futex.clone();
        let task_clone = task.clone();
        let handle = thread::spawn(move || {
            futex_clone.wait(&task_clone, word, Scope::Private, 0, BITSET_MATCH_ANY, None)
        });
        eventually(|| queued(&futex, &space, word, Scope::Private) == 1);

        task.interrupt();
        assert_eq!(handle.join().unwrap(), Err(Error::Interrupted));
        assert_eq!(queued(&futex, &space, word, Scope::Private), 0);
    }

    #[test]
    fn wake_after_store_is_not_lost() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let word = space.map_private(4);
        let waker = futex.tasks().register(space.clone(), Priority::NORMAL);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let futex_clone = futex.clone();
            let space_clone = space.clone();
            let (_, handle) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
                while space_clone.load(word) == Ok(0) {
                    let result =
                        futex_clone.wait(&task, word, Scope::Private, 0, BITSET_MATCH_ANY, None);
                    assert!(matches!(result, Ok(()) | Err(Error::ValueMismatch)));
                }
            });
            handles.push(handle);
        }

        space.store(word, 1).unwrap();
        let woken = futex
            .wake(&waker, word, Scope::Private, usize::MAX, BITSET_MATCH_ANY)
            .unwrap();
        assert!(woken <= 4);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn bitsets_select_waiters() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let word = space.map_private(4);
        let waker = futex.tasks().register(space.clone(), Priority::NORMAL);

        let mut handles = Vec::new();
        for bitset in [0b01, 0b10] {
            let futex_clone = futex.clone();
            let (_, handle) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
                futex_clone.wait(&task, word, Scope::Private, 0, bitset, None)
            });
            handles.push(handle);
        }
        eventually(|| queued(&futex, &space, word, Scope::Private) == 2);

        assert_eq!(futex.wake(&waker, word, Scope::Private, 2, 0b10), Ok(1));
        let second = handles.pop().unwrap();
        assert_eq!(second.join().unwrap(), Ok(()));
        assert_eq!(queued(&futex, &space, word, Scope::Private), 1);

        assert_eq!(futex.wake(&waker, word, Scope::Private, 2, 0b100), Ok(0));
        assert_eq!(futex.wake(&waker, word, Scope::Private, 2, 0b11), Ok(1));
        assert_eq!(handles.pop().unwrap().join().unwrap(), Ok(()));
    }

    #[test]
    fn higher_priority_wakes_first() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let word = space.map_private(4);
        let waker = futex.tasks().register(space.clone(), Priority::NORMAL);
        let order = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for priority in [Priority(10), Priority(90)] {
            let futex_clone = futex.clone();
            let order = order.clone();
            let (_, handle) = spawn_task(&futex, &space, priority, move |task| {
                futex_clone
                    .wait(&task, word, Scope::Private, 0, BITSET_MATCH_ANY, None)
                    .unwrap();
                order.fetch_add(1, Relaxed)
            });
            handles.push(handle);
            let expected = handles.len();
            eventually(|| queued(&futex, &space, word, Scope::Private) == expected);
        }

        assert_eq!(futex.wake(&waker, word, Scope::Private, 1, BITSET_MATCH_ANY), Ok(1));
        let urgent = handles.pop().unwrap();
        assert_eq!(urgent.join().unwrap(), 0);
        assert_eq!(futex.wake(&waker, word, Scope::Private, 1, BITSET_MATCH_ANY), Ok(1));
        assert_eq!(handles.pop().unwrap().join().unwrap(), 1);
    }

    #[test]
    fn shared_words_alias_across_spaces() {
        let futex = Arc::new(Futex::new());
        let object = MemoryObject::new(PAGE_SIZE);
        let first = AddressSpace::new();
        let second = AddressSpace::new();
        let a = first.map_shared(&object, 0, PAGE_SIZE).unwrap();
        let b = second.map_shared(&object, 0, PAGE_SIZE).unwrap();
        let waker = futex.tasks().register(second.clone(), Priority::NORMAL);

        let futex_clone = futex.clone();
        let (_, handle) = spawn_task(&futex, &first, Priority::NORMAL, move |task| {
            futex_clone.wait(&task, a + 8, Scope::Shared, 0, BITSET_MATCH_ANY, None)
        });
        eventually(|| queued(&futex, &second, b + 8, Scope::Shared) == 1);

        // A private key of the other space does not reach the waiter.
        assert_eq!(futex.wake(&waker, b + 8, Scope::Private, 1, BITSET_MATCH_ANY), Ok(0));
        assert_eq!(futex.wake(&waker, b + 8, Scope::Shared, 1, BITSET_MATCH_ANY), Ok(1));
        assert_eq!(handle.join().unwrap(), Ok(()));
    }

    #[test]
    fn wake_op_updates_and_wakes_conditionally() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let first = space.map_private(8);
        let second = first + 4;
        let waker = futex.tasks().register(space.clone(), Priority::NORMAL);

        let mut handles = Vec::new();
        for word in [first, second, second] {
            let futex_clone = futex.clone();
            let (_, handle) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
                futex_clone.wait(&task, word, Scope::Private, 0, BITSET_MATCH_ANY, None)
            });
            handles.push(handle);
        }
        eventually(|| {
            queued(&futex, &space, first, Scope::Private) == 1
                && queued(&futex, &space, second, Scope::Private) == 2
        });

        // `old == 1` is false: only the first word's waiter wakes.
        let op = WakeOp::new(ArithOp::Add, 1, Comparison::Eq, 1);
        let woken = futex.wake_op(&waker, first, second, Scope::Private, 1, 2, op);
        assert_eq!(woken, Ok(1));
        assert_eq!(space.load(second), Ok(1));

        // Now `old == 1` holds.
        let woken = futex.wake_op(&waker, first, second, Scope::Private, 1, 2, op);
        assert_eq!(woken, Ok(2));
        assert_eq!(space.load(second), Ok(2));
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
    }
}

mod requeue {
    use super::*;

    #[test]
    fn conserves_waiters() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let source = space.map_private(8);
        let destination = source + 4;
        let waker = futex.tasks().register(space.clone(), Priority::NORMAL);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let futex_clone = futex.clone();
            let (_, handle) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
                futex_clone.wait(&task, source, Scope::Private, 0, BITSET_MATCH_ANY, None)
            });
            handles.push(handle);
        }
        eventually(|| queued(&futex, &space, source, Scope::Private) == 4);

        assert_eq!(
            futex.requeue(&waker, &Requeue::new(source, destination).expect(1)),
            Err(Error::Conflict)
        );
        let moved = futex.requeue(&waker, &Requeue::new(source, destination).requeue(2).expect(0));
        assert_eq!(moved, Ok(3));
        assert_eq!(queued(&futex, &space, source, Scope::Private), 1);
        assert_eq!(queued(&futex, &space, destination, Scope::Private), 2);

        // Moved waiters only respond to the destination word.
        let any = BITSET_MATCH_ANY;
        assert_eq!(futex.wake(&waker, destination, Scope::Private, usize::MAX, any), Ok(2));
        assert_eq!(futex.wake(&waker, source, Scope::Private, usize::MAX, any), Ok(1));
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
    }

    #[test]
    fn pi_mode_rejects_bad_arguments() {
        let futex = Futex::new();
        let space = AddressSpace::new();
        let task = futex.tasks().register(space.clone(), Priority::NORMAL);
        let word = space.map_private(8);

        let mut request = Requeue::new(word, word + 4).pi();
        request.max_wake = 2;
        assert_eq!(futex.requeue(&task, &request), Err(Error::InvalidArgument));
        assert_eq!(
            futex.requeue(&task, &Requeue::new(word, word).pi()),
            Err(Error::InvalidArgument)
        );
        assert_eq!(futex.requeue(&task, &Requeue::new(word, word + 4).pi()), Ok(0));
    }

    #[test]
    fn requeue_pi_hands_free_lock_to_top_waiter() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let condition = space.map_private(8);
        let lock = condition + 4;
        let signaller = futex.tasks().register(space.clone(), Priority::NORMAL);

        let futex_clone = futex.clone();
        let space_clone = space.clone();
        let (waiter, handle) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
            let any = BITSET_MATCH_ANY;
            futex_clone.wait_requeue_pi(&task, condition, Scope::Private, 0, any, None, lock)?;
            let owner = word::owner(space_clone.load(lock)?);
            futex_clone.unlock_pi(&task, lock, Scope::Private)?;
            Ok::<u32, Error>(owner)
        });
        eventually(|| queued(&futex, &space, condition, Scope::Private) == 1);

        // Plain wakes must not touch requeue-PI waiters.
        assert_eq!(
            futex.wake(&signaller, condition, Scope::Private, 1, BITSET_MATCH_ANY),
            Err(Error::InvalidArgument)
        );
        let request = Requeue::new(condition, lock).pi().requeue(8);
        assert_eq!(futex.requeue(&signaller, &request), Ok(1));
        assert_eq!(handle.join().unwrap(), Ok(waiter.tid()));
        assert_eq!(space.load(lock), Ok(0));
    }

    #[test]
    fn requeue_pi_queues_on_held_lock() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let condition = space.map_private(8);
        let lock = condition + 4;
        let owner = futex.tasks().register(space.clone(), Priority::NORMAL);
        futex.lock_pi(&owner, lock, Scope::Private, None).unwrap();

        let holders = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let futex_clone = futex.clone();
            let holders = holders.clone();
            let (_, handle) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
                let any = BITSET_MATCH_ANY;
                futex_clone.wait_requeue_pi(&task, condition, Scope::Private, 0, any, None, lock)?;
                assert_eq!(holders.fetch_add(1, Acquire), 0);
                holders.fetch_sub(1, Release);
                futex_clone.unlock_pi(&task, lock, Scope::Private)
            });
            handles.push(handle);
        }
        eventually(|| queued(&futex, &space, condition, Scope::Private) == 2);

        let request = Requeue::new(condition, lock).pi();
        assert_eq!(futex.requeue(&owner, &request), Ok(2));
        assert_eq!(queued(&futex, &space, lock, Scope::Private), 2);
        assert_ne!(space.load(lock).unwrap() & WAITERS, 0);

        futex.unlock_pi(&owner, lock, Scope::Private).unwrap();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
        assert_eq!(space.load(lock), Ok(0));
    }

    #[test]
    fn requeue_pi_splits_between_owner_and_waiters() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let condition = space.map_private(8);
        let lock = condition + 4;
        let signaller = futex.tasks().register(space.clone(), Priority::NORMAL);

        let holders = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let futex_clone = futex.clone();
            let holders = holders.clone();
            let (_, handle) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
                let any = BITSET_MATCH_ANY;
                futex_clone.wait_requeue_pi(&task, condition, Scope::Private, 0, any, None, lock)?;
                assert_eq!(holders.fetch_add(1, Acquire), 0);
                holders.fetch_sub(1, Release);
                futex_clone.unlock_pi(&task, lock, Scope::Private)
            });
            handles.push(handle);
            let expected = handles.len();
            eventually(|| queued(&futex, &space, condition, Scope::Private) == expected);
        }

        // One waiter is handed the free lock, the other two are queued on it.
        let request = Requeue::new(condition, lock).requeue(5).pi();
        assert_eq!(futex.requeue(&signaller, &request), Ok(3));
        assert_eq!(queued(&futex, &space, condition, Scope::Private), 0);

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
        assert_eq!(space.load(lock), Ok(0));
    }

    #[test]
    fn requeue_pi_waiter_times_out_before_requeue() {
        let futex = Futex::new();
        let space = AddressSpace::new();
        let task = futex.tasks().register(space.clone(), Priority::NORMAL);
        let condition = space.map_private(8);
        let timeout = Some(Duration::from_millis(10));
        let any = BITSET_MATCH_ANY;
        let result =
            futex.wait_requeue_pi(&task, condition, Scope::Private, 0, any, timeout, condition + 4);
        assert_eq!(result, Err(Error::TimedOut));
        assert_eq!(queued(&futex, &space, condition, Scope::Private), 0);
        assert_eq!(
            futex.wait_requeue_pi(&task, condition, Scope::Private, 0, any, None, condition),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn concurrent_requeue_and_wake_account_for_every_waiter() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let source = space.map_private(8);
        let destination = source + 4;

        let mut handles = Vec::new();
        for _ in 0..6 {
            let futex_clone = futex.clone();
            let (_, handle) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
                futex_clone.wait(&task, source, Scope::Private, 0, BITSET_MATCH_ANY, None)
            });
            handles.push(handle);
        }
        eventually(|| queued(&futex, &space, source, Scope::Private) == 6);

        let start = Arc::new(std::sync::Barrier::new(2));
        let futex_clone = futex.clone();
        let start_clone = start.clone();
        let (_, mover) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
            start_clone.wait();
            futex_clone.requeue(&task, &Requeue::new(source, destination).wake(0))
        });
        let futex_clone = futex.clone();
        let (_, waker) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
            start.wait();
            futex_clone.wake(&task, source, Scope::Private, usize::MAX, BITSET_MATCH_ANY)
        });
        let moved = mover.join().unwrap().unwrap();
        let woken = waker.join().unwrap().unwrap();
        assert_eq!(moved + woken, 6);

        let main = futex.tasks().register(space.clone(), Priority::NORMAL);
        let any = BITSET_MATCH_ANY;
        assert_eq!(futex.wake(&main, destination, Scope::Private, usize::MAX, any), Ok(moved));
        assert_eq!(futex.wake(&main, source, Scope::Private, usize::MAX, any), Ok(0));
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(()));
        }
    }
}

mod pi {
    use super::*;

    #[test]
    fn ownership_errors() {
        let futex = Futex::new();
        let space = AddressSpace::new();
        let owner = futex.tasks().register(space.clone(), Priority::NORMAL);
        let other = futex.tasks().register(space.clone(), Priority::NORMAL);
        let lock = space.map_private(4);

        futex.lock_pi(&owner, lock, Scope::Private, None).unwrap();
        assert_eq!(space.load(lock), Ok(owner.tid()));
        assert_eq!(futex.lock_pi(&owner, lock, Scope::Private, None), Err(Error::Deadlock));
        assert_eq!(futex.trylock_pi(&other, lock, Scope::Private), Err(Error::WouldBlock));
        assert_eq!(futex.unlock_pi(&other, lock, Scope::Private), Err(Error::NotOwner));

        // The failed trylock left the waiters flag behind; unlock clears it.
        assert_eq!(space.load(lock), Ok(owner.tid() | WAITERS));
        futex.unlock_pi(&owner, lock, Scope::Private).unwrap();
        assert_eq!(space.load(lock), Ok(0));
        assert!(owner.pi().pi_states.is_empty());

        futex.trylock_pi(&other, lock, Scope::Private).unwrap();
        assert_eq!(space.load(lock), Ok(other.tid()));
    }

    #[test]
    fn owner_gone() {
        let futex = Futex::new();
        let space = AddressSpace::new();
        let task = futex.tasks().register(space.clone(), Priority::NORMAL);
        let lock = space.map_private(4);
        space.store(lock, 12345).unwrap();

        assert_eq!(
            futex.lock_pi(&task, lock, Scope::Private, None),
            Err(Error::OwnerProcessGone)
        );
    }

    #[test]
    fn timeout_withdraws_waiter() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let lock = space.map_private(4);
        let owner = futex.tasks().register(space.clone(), Priority(10));
        futex.lock_pi(&owner, lock, Scope::Private, None).unwrap();

        let futex_clone = futex.clone();
        let (_, handle) = spawn_task(&futex, &space, Priority(90), move |task| {
            futex_clone.lock_pi(&task, lock, Scope::Private, Some(Duration::from_millis(30)))
        });
        assert_eq!(handle.join().unwrap(), Err(Error::TimedOut));
        assert_eq!(owner.priority(), Priority(10));
        assert_eq!(queued(&futex, &space, lock, Scope::Private), 0);
        futex.unlock_pi(&owner, lock, Scope::Private).unwrap();
        assert_eq!(space.load(lock), Ok(0));
    }

    #[test]
    fn mutual_exclusion() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let mutex = PiMutex::new(space.map_private(4), Scope::Private);
        let inside = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let futex_clone = futex.clone();
            let inside = inside.clone();
            let total = total.clone();
            let (_, handle) = spawn_task(&futex, &space, Priority(40 + i), move |task| {
                for _ in 0..64 {
                    mutex.lock(&futex_clone, &task, None).unwrap();
                    assert_eq!(inside.fetch_add(1, Acquire), 0);
                    total.fetch_add(1, Relaxed);
                    inside.fetch_sub(1, Release);
                    mutex.unlock(&futex_clone, &task).unwrap();
                }
            });
            handles.push(handle);
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(total.load(Relaxed), 256);
        assert_eq!(space.load(mutex.address()), Ok(0));
    }

    #[test]
    fn priority_is_inherited_and_returned() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let lock = space.map_private(4);
        let low = futex.tasks().register(space.clone(), Priority(10));
        futex.lock_pi(&low, lock, Scope::Private, None).unwrap();

        let futex_clone = futex.clone();
        let space_clone = space.clone();
        let (high, handle) = spawn_task(&futex, &space, Priority(90), move |task| {
            futex_clone.lock_pi(&task, lock, Scope::Private, None)?;
            let word = space_clone.load(lock)?;
            futex_clone.unlock_pi(&task, lock, Scope::Private)?;
            Ok::<u32, Error>(word)
        });
        eventually(|| low.priority() == Priority(90));

        futex.unlock_pi(&low, lock, Scope::Private).unwrap();
        assert_eq!(low.priority(), Priority(10));
        assert_eq!(handle.join().unwrap(), Ok(high.tid() | WAITERS));
        assert_eq!(high.priority(), Priority(90));
        assert_eq!(space.load(lock), Ok(0));
    }

    #[test]
    fn donation_follows_chain() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let first = space.map_private(8);
        let second = first + 4;
        let bottom = futex.tasks().register(space.clone(), Priority(10));
        futex.lock_pi(&bottom, second, Scope::Private, None).unwrap();

        // `middle` holds `first` and blocks on `second`.
        let futex_clone = futex.clone();
        let (middle, middle_handle) = spawn_task(&futex, &space, Priority(20), move |task| {
            futex_clone.lock_pi(&task, first, Scope::Private, None)?;
            futex_clone.lock_pi(&task, second, Scope::Private, None)?;
            futex_clone.unlock_pi(&task, second, Scope::Private)?;
            futex_clone.unlock_pi(&task, first, Scope::Private)
        });
        eventually(|| bottom.priority() == Priority(20));

        let futex_clone = futex.clone();
        let (_, top_handle) = spawn_task(&futex, &space, Priority(90), move |task| {
            futex_clone.lock_pi(&task, first, Scope::Private, None)?;
            futex_clone.unlock_pi(&task, first, Scope::Private)
        });
        eventually(|| middle.priority() == Priority(90) && bottom.priority() == Priority(90));

        futex.unlock_pi(&bottom, second, Scope::Private).unwrap();
        assert_eq!(bottom.priority(), Priority(10));
        assert_eq!(middle_handle.join().unwrap(), Ok(()));
        assert_eq!(top_handle.join().unwrap(), Ok(()));
        assert_eq!(space.load(first), Ok(0));
        assert_eq!(space.load(second), Ok(0));
    }

    #[test]
    fn cycle_is_reported_as_deadlock() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let first = space.map_private(8);
        let second = first + 4;
        let main = futex.tasks().register(space.clone(), Priority::NORMAL);
        futex.lock_pi(&main, first, Scope::Private, None).unwrap();

        let futex_clone = futex.clone();
        let (other, handle) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
            futex_clone.lock_pi(&task, second, Scope::Private, None)?;
            let result = futex_clone.lock_pi(&task, first, Scope::Private, None);
            futex_clone.unlock_pi(&task, second, Scope::Private)?;
            result?;
            futex_clone.unlock_pi(&task, first, Scope::Private)
        });
        eventually(|| other.pi().blocked_on.is_some());

        assert_eq!(futex.lock_pi(&main, second, Scope::Private, None), Err(Error::Deadlock));
        futex.unlock_pi(&main, first, Scope::Private).unwrap();
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert_eq!(space.load(first), Ok(0));
        assert_eq!(space.load(second), Ok(0));
    }

    #[test]
    fn waiters_flag_survives_hand_off() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let lock = space.map_private(4);
        let first = futex.tasks().register(space.clone(), Priority(10));
        futex.lock_pi(&first, lock, Scope::Private, None).unwrap();

        let (go, wait_for_go) = mpsc::channel::<()>();
        let futex_clone = futex.clone();
        let (second, second_handle) = spawn_task(&futex, &space, Priority(20), move |task| {
            futex_clone.lock_pi(&task, lock, Scope::Private, None)?;
            wait_for_go.recv().unwrap();
            PiMutex::new(lock, Scope::Private).unlock(&futex_clone, &task)
        });
        eventually(|| queued(&futex, &space, lock, Scope::Private) == 1);

        // The only waiter takes over; the word still routes the next unlock through the engine.
        futex.unlock_pi(&first, lock, Scope::Private).unwrap();
        eventually(|| space.load(lock) == Ok(second.tid() | WAITERS));

        let futex_clone = futex.clone();
        let (_, third_handle) = spawn_task(&futex, &space, Priority(90), move |task| {
            let timeout = Some(Duration::from_secs(5));
            futex_clone.lock_pi(&task, lock, Scope::Private, timeout)?;
            futex_clone.unlock_pi(&task, lock, Scope::Private)
        });
        eventually(|| second.priority() == Priority(90));

        go.send(()).unwrap();
        assert_eq!(second_handle.join().unwrap(), Ok(()));
        assert_eq!(third_handle.join().unwrap(), Ok(()));
        assert_eq!(second.priority(), Priority(20));
        assert_eq!(space.load(lock), Ok(0));
    }

    #[test]
    fn unlock_hands_off_to_highest_priority() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let lock = space.map_private(4);
        let low = futex.tasks().register(space.clone(), Priority(10));
        futex.lock_pi(&low, lock, Scope::Private, None).unwrap();

        let order = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for priority in [Priority(60), Priority(90)] {
            let futex_clone = futex.clone();
            let space_clone = space.clone();
            let order = order.clone();
            let (_, handle) = spawn_task(&futex, &space, priority, move |task| {
                futex_clone.lock_pi(&task, lock, Scope::Private, None)?;
                let position = order.fetch_add(1, Relaxed);
                let word = space_clone.load(lock)?;
                PiMutex::new(lock, Scope::Private).unlock(&futex_clone, &task)?;
                Ok::<(usize, u32), Error>((position, word))
            });
            handles.push(handle);
        }
        eventually(|| {
            low.priority() == Priority(90) && queued(&futex, &space, lock, Scope::Private) == 2
        });

        futex.unlock_pi(&low, lock, Scope::Private).unwrap();
        assert_eq!(low.priority(), Priority(10));

        let urgent = handles.pop().unwrap().join().unwrap().unwrap();
        let normal = handles.pop().unwrap().join().unwrap().unwrap();
        assert_eq!(urgent.0, 0);
        assert_eq!(normal.0, 1);
        // The word keeps WAITERS while the lock is handed on through the engine.
        assert_ne!(urgent.1 & WAITERS, 0);
        assert_ne!(normal.1 & WAITERS, 0);
        assert_eq!(space.load(lock), Ok(0));
    }
}

mod robust {
    use super::*;

    #[test]
    fn registration() {
        let futex = Futex::new();
        let space = AddressSpace::new();
        let task = futex.tasks().register(space.clone(), Priority::NORMAL);
        let head = space.map_private(64);
        assert_eq!(futex.register_lock_list(&task, head, 16), Err(Error::InvalidArgument));
        assert_eq!(futex.register_pending(&task, Some((head, false))), Err(Error::InvalidArgument));
        assert_eq!(futex.robust_list(task.id()), Ok(None));
        futex.register_lock_list(&task, head, crate::ROBUST_LIST_HEAD_SIZE).unwrap();
        assert_eq!(futex.robust_list(task.id()), Ok(Some(head)));
        futex.register_pending(&task, Some((head + 32, true))).unwrap();
        assert_eq!(space.load_u64(head + 16), Ok((head as u64 + 32) | 1));
    }

    #[test]
    fn exit_marks_held_locks_and_wakes_waiter() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let base = space.map_private(256);
        let (plain, pi, pending) = (base + 64 + 8, base + 128 + 8, base + 192 + 8);
        let other = futex.tasks().register(space.clone(), Priority::NORMAL);

        let dying = futex.tasks().register(space.clone(), Priority::NORMAL);
        let list = RobustList::init(&futex, &dying, base, 8).unwrap();
        space.store(plain, dying.tid()).unwrap();
        list.push(&space, base + 64, false).unwrap();
        space.store(pi, dying.tid()).unwrap();
        list.push(&space, base + 128, true).unwrap();
        futex.register_pending(&dying, Some((base + 192, false))).unwrap();

        // A waiter announces itself on the plain lock before sleeping.
        let futex_clone = futex.clone();
        let space_clone = space.clone();
        let (_, handle) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
            loop {
                let value = space_clone.load(plain).unwrap();
                if value & OWNER_DIED != 0 {
                    return value;
                }
                if value & WAITERS == 0
                    && space_clone.compare_exchange(plain, value, value | WAITERS) != Ok(value)
                {
                    continue;
                }
                let any = BITSET_MATCH_ANY;
                let result =
                    futex_clone.wait(&task, plain, Scope::Private, value | WAITERS, any, None);
                assert!(matches!(result, Ok(()) | Err(Error::ValueMismatch)));
            }
        });
        eventually(|| queued(&futex, &space, plain, Scope::Private) == 1);

        futex.exit(&dying);
        assert_eq!(handle.join().unwrap(), WAITERS | OWNER_DIED);
        assert_eq!(space.load(pi), Ok(OWNER_DIED));
        assert_eq!(space.load(pending), Ok(0));
        assert_eq!(dying.exit_state(), ExitState::Dead);
        assert!(futex.tasks().get(dying.id()).is_none());
        futex.exit(&dying);

        // The abandoned PI lock can be taken over; the flag survives.
        futex.lock_pi(&other, pi, Scope::Private, None).unwrap();
        assert_eq!(space.load(pi), Ok(OWNER_DIED | other.tid()));
    }

    #[test]
    fn words_of_other_owners_are_left_alone() {
        let futex = Futex::new();
        let space = AddressSpace::new();
        let base = space.map_private(128);
        let task = futex.tasks().register(space.clone(), Priority::NORMAL);
        let list = RobustList::init(&futex, &task, base, 8).unwrap();
        list.push(&space, base + 64, false).unwrap();
        space.store(base + 72, 777).unwrap();

        futex.exec(&task);
        assert_eq!(space.load(base + 72), Ok(777));
        assert_eq!(task.exit_state(), ExitState::Alive);
        assert_eq!(task.robust_list(), None);
    }

    #[test]
    fn circular_list_is_bounded() {
        let futex = Futex::new();
        let space = AddressSpace::new();
        let base = space.map_private(128);
        let task = futex.tasks().register(space.clone(), Priority::NORMAL);
        RobustList::init(&futex, &task, base, 8).unwrap();
        // Two nodes pointing at each other never lead back to the head.
        space.store_u64(base, base as u64 + 64).unwrap();
        space.store_u64(base + 64, base as u64 + 96).unwrap();
        space.store_u64(base + 96, base as u64 + 64).unwrap();
        space.store(base + 72, task.tid()).unwrap();

        futex.exit(&task);
        assert_eq!(space.load(base + 72), Ok(OWNER_DIED));
    }

    #[test]
    fn exiting_pi_owner_hands_lock_to_waiter() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let lock = space.map_private(4);
        let dying = futex.tasks().register(space.clone(), Priority::NORMAL);
        futex.lock_pi(&dying, lock, Scope::Private, None).unwrap();

        let futex_clone = futex.clone();
        let space_clone = space.clone();
        let (heir, handle) = spawn_task(&futex, &space, Priority::NORMAL, move |task| {
            futex_clone.lock_pi(&task, lock, Scope::Private, None)?;
            let word = space_clone.load(lock)?;
            futex_clone.unlock_pi(&task, lock, Scope::Private)?;
            Ok::<u32, Error>(word)
        });
        eventually(|| queued(&futex, &space, lock, Scope::Private) == 1);

        futex.exit(&dying);
        let word = handle.join().unwrap().unwrap();
        assert_eq!(word::owner(word), heir.tid());
        assert_ne!(word & OWNER_DIED, 0);
        assert_eq!(space.load(lock), Ok(0));
    }
}

mod asynchronous {
    use super::*;

    #[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wait_async_is_woken() {
        let futex = Arc::new(Futex::new());
        let space = AddressSpace::new();
        let word = space.map_private(4);
        let waiter = futex.tasks().register(space.clone(), Priority::NORMAL);
        let waker = futex.tasks().register(space.clone(), Priority::NORMAL);

        let futex_clone = futex.clone();
        let task = tokio::spawn(async move {
            futex_clone
                .wait_async(&waiter, word, Scope::Private, 0, BITSET_MATCH_ANY)
                .await
        });
        while queued(&futex, &space, word, Scope::Private) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(futex.wake(&waker, word, Scope::Private, 1, BITSET_MATCH_ANY), Ok(1));
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[cfg_attr(miri, ignore = "Tokio is not compatible with Miri")]
    #[tokio::test]
    async fn dropped_future_withdraws_waiter() {
        let futex = Futex::new();
        let space = AddressSpace::new();
        let word = space.map_private(4);
        let task = futex.tasks().register(space.clone(), Priority::NORMAL);

        let wait = futex.wait_async(&task, word, Scope::Private, 0, BITSET_MATCH_ANY);
        assert!(tokio::time::timeout(Duration::from_millis(10), wait).await.is_err());
        assert_eq!(queued(&futex, &space, word, Scope::Private), 0);
        let key = key::resolve(&space, word, Scope::Private).unwrap();
        assert_eq!(futex.table.bucket(futex.table.index_of(&key)).pending(), 0);
        assert_eq!(futex.wake(&task, word, Scope::Private, 1, BITSET_MATCH_ANY), Ok(0));
    }
}
