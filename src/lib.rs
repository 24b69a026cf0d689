#![deny(missing_docs, clippy::all, clippy::pedantic)]
#![doc = include_str!("../README.md")]

pub mod config;
pub use config::{Config, DefaultConfig};

pub mod error;
pub use error::Error;

pub mod key;
pub use key::{Key, Scope};

pub mod memory;
pub use memory::{AddressSpace, MemoryObject, PAGE_SIZE, SpaceId};

pub mod opcode;
pub use opcode::{ArithOp, Comparison, WakeOp};

pub mod task;
pub use task::{ExitState, Priority, Task, TaskId, TaskRegistry};

pub mod user;

pub mod word;
pub use word::{BITSET_MATCH_ANY, TID_MASK, WordFlags};

mod futex;
pub use futex::Futex;

mod requeue;
pub use requeue::Requeue;

mod robust;
pub use robust::ROBUST_LIST_HEAD_SIZE;

mod bucket;
mod lock;
mod lock_api;
mod pi;
mod retry;
mod rt_mutex;
mod wait;
mod waiter;
