//! Synchronization primitives built over [`crate::wait_queue::WaitQueue`]
//! (`SPEC_FULL.md` §4.9). Each one follows the same cancellation discipline:
//! a release/notify mutates shared state and wakes one (or all) waiters
//! without committing to who benefits from it, so a waiter cancelled before
//! it gets to run can tell, from that same shared state, whether to
//! re-wake the next one in its place.

pub mod condition;
pub mod event;
pub mod lock;
pub mod queue;
pub mod semaphore;
pub mod universal_queue;

pub use condition::Condition;
pub use event::Event;
pub use lock::{Lock, RLock};
pub use queue::{FifoQueue, LifoQueue, PriorityQueue, Queue, Storage};
pub use semaphore::Semaphore;
pub use universal_queue::UniversalQueue;
