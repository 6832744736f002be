//! Per-task bookkeeping: identity, lifecycle state, and the fields the
//! cancellation engine and run loop need to reach without going through the
//! type-erased coroutine itself.
//!
//! The coroutine body (the `async fn`/boxed `Future` the task is running) is
//! kept separately in [`crate::kernel::TaskSlot`] — this struct is the
//! scheduler-visible metadata, directly analogous to the teacher's `Process`
//! struct's state fields, minus everything MPU/grant-shaped that has no
//! counterpart in a user-space runtime.

use std::cell::RefCell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::cancellation::TimeoutFrame;
use crate::error::Direction;
use crate::task_group::TaskGroupId;
use crate::timer_heap::TimerToken;
use crate::wait_queue::WaitQueue;

/// Monotonically increasing task identifier, unique for the lifetime of the
/// kernel that minted it (never reused, unlike a generational slot key).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn from_raw(raw: u64) -> TaskId {
        TaskId(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a task currently stands. Exactly one of these holds per task at any
/// instant, and `Running` holds for at most one task per kernel instant
/// (`SPEC_FULL.md` §3 invariants).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    /// On the ready queue, waiting for its turn to run.
    Ready,
    /// Currently being driven by the run loop.
    Running,
    /// Suspended in `read_wait(fd)`.
    ReadWait,
    /// Suspended in `write_wait(fd)`.
    WriteWait,
    /// Suspended in `sleep(deadline)`.
    TimeSleep,
    /// Suspended in `future_wait(fut)`, awaiting an externally-driven future.
    FutureWait,
    /// Suspended on a `WaitQueue` via `scheduler_wait`.
    SchedWait,
    /// Finished, successfully or otherwise; appears in no wait structure.
    Terminated,
}

impl State {
    pub fn is_runnable(self) -> bool {
        matches!(self, State::Ready | State::Running)
    }

    pub fn is_suspended(self) -> bool {
        matches!(
            self,
            State::ReadWait | State::WriteWait | State::TimeSleep | State::FutureWait | State::SchedWait
        )
    }
}

/// Scheduler-visible metadata for one task.
pub struct Task {
    pub id: TaskId,
    pub state: State,
    pub daemon: bool,
    /// Number of times this task has been dispatched (scheduled) by the run
    /// loop. Purely observational.
    pub cycles: u64,
    /// The exception to deliver at the next cancellation point, if any.
    /// Stays set while `allow_cancel_depth > 0`; delivery is merely deferred,
    /// never forgotten (P2: at most one delivery, but the request itself can
    /// be coalesced from repeat callers).
    pub cancel_pending: Option<crate::error::CancellationError>,
    /// Depth of nested `disable_cancellation` shields. Cancellation may be
    /// delivered only when this is zero.
    pub allow_cancel_depth: u32,
    /// Nested timeout frames, innermost last. The kernel's effective
    /// deadline for this task is the minimum live deadline across this stack.
    pub timeout_stack: Vec<TimeoutFrame>,
    /// Tasks suspended in `join()` on this task's termination. Shared via
    /// `Rc` so a joiner's `SchedulerWait` trap future can hold the same
    /// handle the generic sync primitives use, rather than needing a
    /// dedicated trap just for joining.
    pub joiners: Rc<RefCell<WaitQueue>>,
    pub terminated: bool,
    pub cancelled: bool,
    /// The group that owns this task, if spawned via `TaskGroup::spawn`.
    pub group: Option<TaskGroupId>,

    /// Routing bookkeeping so `cancel_task` can evict a suspended task from
    /// whichever single wait structure currently holds it, without the
    /// kernel needing a global registry (`SPEC_FULL.md` §9 "cyclic
    /// references"). Exactly one of these is set whenever `state` is a
    /// suspended variant; all are `None` otherwise.
    pub waiting_on: Option<Weak<RefCell<WaitQueue>>>,
    pub io_wait: Option<(RawFd, Direction)>,
    pub timer_token: Option<TimerToken>,
}

impl Task {
    pub fn new(id: TaskId, daemon: bool) -> Task {
        Task {
            id,
            state: State::Ready,
            daemon,
            cycles: 0,
            cancel_pending: None,
            allow_cancel_depth: 0,
            timeout_stack: Vec::new(),
            joiners: Rc::new(RefCell::new(WaitQueue::new())),
            terminated: false,
            cancelled: false,
            group: None,
            waiting_on: None,
            io_wait: None,
            timer_token: None,
        }
    }

    pub fn allow_cancel(&self) -> bool {
        self.allow_cancel_depth == 0
    }

    /// The innermost live frame — the one that "owns" an expiry unless some
    /// other frame's deadline ties with, or precedes, it.
    pub fn innermost_frame(&self) -> Option<&TimeoutFrame> {
        self.timeout_stack.iter().rev().find(|f| !f.expired)
    }
}
