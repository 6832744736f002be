//! The `Kernel`: task table, ready queue, and the run loop that dispatches
//! traps. It picks the next ready task and drives its future until a trap
//! future returns `Pending`, then moves on to the next one.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::ThreadId;
use std::time::Duration;

use crate::cancellation::{self, TimeoutFrame, TimeoutKind};
use crate::clock::Clock;
use crate::config::{invoke_activation, KernelConfig};
use crate::error::{CancellationError, Direction, KernelError, TimeoutFrameId, UserError};
use crate::readiness::ReadinessSelector;
use crate::task::{State, Task, TaskId};
use crate::task_group::TaskGroupId;
use crate::timer_heap::{TimerHeap, TimerKind};
use crate::wait_queue::WaitQueue;

/// A task's outcome, type-erased to `Rc<dyn Any>` on success so one task
/// table can hold tasks of unrelated result types. `Rc`/`Rc<UserError>`
/// rather than `Box`/owned so the slot's stored outcome can be cloned out on
/// every `join()` instead of consumed — the result stays retrievable for as
/// long as any handle to the task is alive.
pub type TaskOutcome = Result<Rc<dyn Any>, Rc<UserError>>;
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = TaskOutcome>>>;

thread_local! {
    static CURRENT_KERNEL: RefCell<Option<Weak<RefCell<Inner>>>> = RefCell::new(None);
}

/// Sync trap `get_kernel()` — the ambient kernel for the thread currently
/// executing a task body. `None` outside `Kernel::run`.
pub(crate) fn current_kernel() -> Option<Rc<RefCell<Inner>>> {
    CURRENT_KERNEL.with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
}

/// Clears the thread-local binding on drop even if `run` unwinds.
struct ThreadBindingGuard;
impl Drop for ThreadBindingGuard {
    fn drop(&mut self) {
        CURRENT_KERNEL.with(|cell| *cell.borrow_mut() = None);
    }
}

/// Cross-thread-safe companion to the (otherwise entirely single-threaded,
/// `Rc`-based) kernel: the only piece of state a foreign thread may touch,
/// via `std::task::Wake`, `mio::Waker`, or the synchronous side of
/// `UniversalQueue`.
pub(crate) struct WakeQueue {
    pending: Mutex<VecDeque<TaskId>>,
    waker: mio::Waker,
}

impl WakeQueue {
    pub(crate) fn push(&self, task: TaskId) {
        self.pending.lock().unwrap().push_back(task);
        let _ = self.waker.wake();
    }

    fn drain(&self) -> Vec<TaskId> {
        let mut pending = self.pending.lock().unwrap();
        pending.drain(..).collect()
    }
}

struct TaskWaker {
    task: TaskId,
    queue: Arc<WakeQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.queue.push(self.task);
    }
    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.push(self.task);
    }
}

pub(crate) struct TaskSlot {
    pub meta: Task,
    future: Option<BoxFuture>,
    waker: Waker,
    result: Option<TaskOutcome>,
}

pub(crate) struct GroupState {
    pub members: Vec<TaskId>,
    /// Member task ids in the order they actually terminated — what
    /// `TaskGroup::next_done` iterates, independent of spawn order.
    pub completed: Vec<TaskId>,
    /// Woken whenever a member of this group terminates, so `next_done`
    /// has something to `scheduler_wait` on between polls.
    pub activity: Rc<RefCell<WaitQueue>>,
}

impl GroupState {
    fn new() -> GroupState {
        GroupState {
            members: Vec::new(),
            completed: Vec::new(),
            activity: Rc::new(RefCell::new(WaitQueue::new())),
        }
    }
}

/// Everything the run loop and the trap futures need, behind one
/// `Rc<RefCell<_>>` — single-threaded by construction: exactly one task
/// runs at a time per kernel.
pub struct Inner {
    tasks: HashMap<TaskId, TaskSlot>,
    ready: VecDeque<TaskId>,
    next_id: u64,
    next_frame_id: u64,
    current: Option<TaskId>,
    clock: Clock,
    timers: TimerHeap,
    readiness: ReadinessSelector,
    wake_queue: Arc<WakeQueue>,
    config: KernelConfig,
    bound_thread: Option<ThreadId>,
    pub(crate) groups: HashMap<TaskGroupId, GroupState>,
    next_group_id: u64,
}

impl Inner {
    pub(crate) fn current(&self) -> TaskId {
        self.current.expect(
            "a trap was polled with no task currently running — traps may only be \
             constructed and awaited from inside a task body",
        )
    }

    pub(crate) fn clock_now(&self) -> f64 {
        self.clock.now()
    }

    pub(crate) fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn mark_ready(&mut self, task: TaskId) {
        if let Some(slot) = self.tasks.get_mut(&task) {
            slot.meta.state = State::Ready;
        }
        self.ready.push_back(task);
    }

    /// Consume a pending cancellation if the task is currently allowed to
    /// receive it. Called at the top of every trap future's `poll`,
    /// realizing "every blocking trap checks for pending cancellation
    /// before suspending and after being rescheduled".
    pub(crate) fn take_pending_cancellation(&mut self, task: TaskId) -> Option<KernelError> {
        let slot = self.tasks.get_mut(&task)?;
        if !slot.meta.allow_cancel() {
            return None;
        }
        let exc = slot.meta.cancel_pending.take()?;
        slot.meta.cancelled = true;
        if self.config.trace_syscalls {
            tracing::trace!(task = task.as_u64(), ?exc, "delivering cancellation");
        }
        Some(KernelError::Cancelled(exc))
    }

    // --- disable_cancellation / check_cancellation --------------------------

    /// Enter a `disable_cancellation` shield for `task`: bump its nesting
    /// depth so [`Self::take_pending_cancellation`] stays a no-op until the
    /// matching [`Self::pop_shield`].
    pub(crate) fn push_shield(&mut self, task: TaskId) {
        if let Some(slot) = self.tasks.get_mut(&task) {
            slot.meta.allow_cancel_depth += 1;
        }
    }

    /// Exit one shield level. Does not itself redeliver a pending
    /// cancellation — that only happens at the next blocking trap, once
    /// `allow_cancel` becomes true again.
    pub(crate) fn pop_shield(&mut self, task: TaskId) {
        if let Some(slot) = self.tasks.get_mut(&task) {
            slot.meta.allow_cancel_depth = slot.meta.allow_cancel_depth.saturating_sub(1);
        }
    }

    /// `check_cancellation()` — peek the pending exception without
    /// consuming it.
    pub(crate) fn peek_pending_cancellation(&self, task: TaskId) -> Option<CancellationError> {
        self.tasks.get(&task).and_then(|s| s.meta.cancel_pending.clone())
    }

    /// `check_cancellation(exc_type)` — consume the pending exception only
    /// if `matches` accepts it, leaving it pending otherwise.
    pub(crate) fn clear_pending_cancellation_if<F>(&mut self, task: TaskId, matches: F) -> Option<CancellationError>
    where
        F: FnOnce(&CancellationError) -> bool,
    {
        let slot = self.tasks.get_mut(&task)?;
        let hit = slot.meta.cancel_pending.as_ref().map(matches).unwrap_or(false);
        if hit {
            slot.meta.cancel_pending.take()
        } else {
            None
        }
    }

    // --- read_wait / write_wait -------------------------------------------------

    pub(crate) fn register_io(
        &mut self,
        task: TaskId,
        fd: RawFd,
        direction: Direction,
    ) -> Result<(), KernelError> {
        let busy = self.tasks.values().any(|slot| {
            slot.meta.id != task && slot.meta.io_wait == Some((fd, direction))
        });
        if busy {
            return Err(KernelError::ResourceBusy { fd, direction });
        }
        self.readiness
            .register(fd, direction)
            .map_err(|e| KernelError::SyncIOError(e.to_string()))?;
        if let Some(slot) = self.tasks.get_mut(&task) {
            slot.meta.io_wait = Some((fd, direction));
            slot.meta.state = match direction {
                Direction::Read => State::ReadWait,
                Direction::Write => State::WriteWait,
            };
        }
        Ok(())
    }

    pub(crate) fn unregister_io(&mut self, task: TaskId) {
        if let Some(slot) = self.tasks.get_mut(&task) {
            if let Some((fd, direction)) = slot.meta.io_wait.take() {
                let _ = self.readiness.unregister(fd, direction);
            }
        }
    }

    /// `io_waiting(fd)` — whether some task currently holds a read or write
    /// registration on `fd`, and in which direction(s). Introspection only;
    /// does not itself register anything.
    pub(crate) fn io_waiting(&self, fd: RawFd) -> (bool, bool) {
        let mut reading = false;
        let mut writing = false;
        for slot in self.tasks.values() {
            match slot.meta.io_wait {
                Some((f, Direction::Read)) if f == fd => reading = true,
                Some((f, Direction::Write)) if f == fd => writing = true,
                _ => {}
            }
        }
        (reading, writing)
    }

    // --- sleep -------------------------------------------------------------

    pub(crate) fn register_sleep(&mut self, task: TaskId, deadline: f64) {
        let token = self.timers.push(task, deadline, TimerKind::Sleep);
        if let Some(slot) = self.tasks.get_mut(&task) {
            slot.meta.timer_token = Some(token);
            slot.meta.state = State::TimeSleep;
        }
    }

    pub(crate) fn unregister_sleep(&mut self, task: TaskId) {
        if let Some(slot) = self.tasks.get_mut(&task) {
            if let Some(token) = slot.meta.timer_token.take() {
                self.timers.cancel(token);
            }
        }
    }

    // --- scheduler_wait ------------------------------------------------------

    pub(crate) fn suspend_on(&mut self, task: TaskId, wq: &Rc<RefCell<WaitQueue>>) {
        wq.borrow_mut().suspend(task);
        if let Some(slot) = self.tasks.get_mut(&task) {
            slot.meta.waiting_on = Some(Rc::downgrade(wq));
            slot.meta.state = State::SchedWait;
        }
    }

    pub(crate) fn clear_wait(&mut self, task: TaskId) {
        if let Some(slot) = self.tasks.get_mut(&task) {
            slot.meta.waiting_on = None;
        }
    }

    /// `scheduler_wake(wq, n=1, ...)` — move one waiter to the ready queue,
    /// tail-preserving FIFO order.
    pub(crate) fn wake_one(&mut self, wq: &Rc<RefCell<WaitQueue>>) -> Option<TaskId> {
        let woken = wq.borrow_mut().wake_one()?;
        self.clear_wait(woken);
        self.mark_ready(woken);
        Some(woken)
    }

    pub(crate) fn wake_all(&mut self, wq: &Rc<RefCell<WaitQueue>>) -> Vec<TaskId> {
        let woken = wq.borrow_mut().wake_all();
        for &id in &woken {
            self.clear_wait(id);
            self.mark_ready(id);
        }
        woken
    }

    // --- future_wait -----------------------------------------------------------

    /// Take `task` out of the ready rotation while it waits on an
    /// externally-driven future. There is nothing to unregister on eviction
    /// (unlike I/O, sleep, or a `WaitQueue` wait): the wrapped future is
    /// simply dropped along with the trap, and re-readying happens entirely
    /// through the `wake_queue` drain in `poll_external`.
    pub(crate) fn register_future_wait(&mut self, task: TaskId) {
        if let Some(slot) = self.tasks.get_mut(&task) {
            slot.meta.state = State::FutureWait;
        }
    }

    // --- timeout frames ------------------------------------------------------

    pub(crate) fn push_timeout_frame(&mut self, seconds: f64, kind: TimeoutKind) -> TimeoutFrameId {
        let task = self.current();
        let deadline = self.clock.now() + seconds;
        let frame_id = TimeoutFrameId(self.next_frame_id);
        self.next_frame_id += 1;
        let token = self
            .timers
            .push(task, deadline, TimerKind::TimeoutFrame(frame_id));
        let frame = TimeoutFrame::new(frame_id, deadline, kind, token);
        if let Some(slot) = self.tasks.get_mut(&task) {
            slot.meta.timeout_stack.push(frame);
        }
        frame_id
    }

    /// Pop a timeout frame (scope exit, whether by normal return or a
    /// propagating error), cancelling its timer entry if it never fired.
    /// Returns whether the frame's own deadline had already expired.
    pub(crate) fn pop_timeout_frame(&mut self, frame_id: TimeoutFrameId) -> bool {
        let task = self.current();
        let Some(slot) = self.tasks.get_mut(&task) else {
            return false;
        };
        let Some(pos) = slot
            .meta
            .timeout_stack
            .iter()
            .position(|f| f.id == frame_id)
        else {
            return false;
        };
        let frame = slot.meta.timeout_stack.remove(pos);
        if !frame.expired {
            self.timers.cancel(frame.timer_token);
        }
        frame.expired
    }

    // --- cancellation ----------------------------------------------------------

    /// Set `cancel_pending` (coalesced — a second request joins the first)
    /// and, if the task is both suspended and currently allowed to receive
    /// it, evict it from whatever wait structure holds it and reschedule
    /// with the exception ready to be delivered at the next trap poll.
    pub(crate) fn deliver_or_pend(&mut self, task: TaskId, exc: CancellationError) {
        let (evict, state) = {
            let Some(slot) = self.tasks.get_mut(&task) else {
                return;
            };
            if slot.meta.terminated {
                return;
            }
            if slot.meta.cancel_pending.is_none() {
                slot.meta.cancel_pending = Some(exc);
            }
            (slot.meta.allow_cancel() && slot.meta.state.is_suspended(), slot.meta.state)
        };
        if evict {
            self.evict_and_reschedule(task, state);
        }
    }

    fn evict_and_reschedule(&mut self, task: TaskId, state: State) {
        match state {
            State::ReadWait | State::WriteWait => self.unregister_io(task),
            State::TimeSleep => self.unregister_sleep(task),
            State::SchedWait => {
                if let Some(slot) = self.tasks.get_mut(&task) {
                    if let Some(wq) = slot.meta.waiting_on.take().and_then(|w| w.upgrade()) {
                        wq.borrow_mut().cancel_wait(task);
                    }
                }
            }
            State::FutureWait | State::Ready | State::Running | State::Terminated => {}
        }
        self.mark_ready(task);
    }

    /// `cancel_task(t)` — request cancellation of `t` with a kernel-minted
    /// `TaskCancelled`. Returns `false` if `t` had already terminated.
    pub(crate) fn cancel_task(&mut self, task: TaskId) -> bool {
        let Some(slot) = self.tasks.get(&task) else {
            return false;
        };
        if slot.meta.terminated {
            return false;
        }
        let exc = (self.config.cancel_exception_factory)();
        self.deliver_or_pend(task, exc);
        true
    }

    // --- spawning ----------------------------------------------------------

    fn alloc_id(&mut self) -> TaskId {
        let id = TaskId::from_raw(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn alloc_group_id(&mut self) -> TaskGroupId {
        let id = TaskGroupId::from_raw(self.next_group_id);
        self.next_group_id += 1;
        id
    }

    pub(crate) fn group_activity(&self, gid: TaskGroupId) -> Option<Rc<RefCell<WaitQueue>>> {
        self.groups.get(&gid).map(|g| g.activity.clone())
    }

    /// `TaskGroup::add_task(existing)` — attach an already-running (or
    /// already-terminated) ungrouped task to `gid` after the fact.
    pub(crate) fn attach_to_group(&mut self, task: TaskId, gid: TaskGroupId) {
        let terminated = {
            let Some(slot) = self.tasks.get_mut(&task) else {
                return;
            };
            slot.meta.group = Some(gid);
            slot.meta.terminated
        };
        let group_state = self.groups.entry(gid).or_insert_with(GroupState::new);
        group_state.members.push(task);
        if terminated {
            group_state.completed.push(task);
            let activity = group_state.activity.clone();
            self.wake_all(&activity);
        }
    }

    pub(crate) fn spawn_erased(
        self_rc: &Rc<RefCell<Inner>>,
        fut: BoxFuture,
        daemon: bool,
        group: Option<TaskGroupId>,
    ) -> TaskId {
        let mut inner = self_rc.borrow_mut();
        let id = inner.alloc_id();
        let queue = inner.wake_queue.clone();
        let waker = Waker::from(Arc::new(TaskWaker { task: id, queue }));
        let mut meta = Task::new(id, daemon);
        meta.group = group;
        inner.tasks.insert(
            id,
            TaskSlot {
                meta,
                future: Some(fut),
                waker,
                result: None,
            },
        );
        if let Some(gid) = group {
            inner
                .groups
                .entry(gid)
                .or_insert_with(GroupState::new)
                .members
                .push(id);
        }
        inner.mark_ready(id);
        let activation = inner.config.activation_or_null();
        invoke_activation(&activation, |a| a.created(id));
        id
    }

    // --- run loop ------------------------------------------------------------

    /// Advance exactly one dispatched task by one step; returns `true` if
    /// the run loop did useful work (dispatched a task or drained I/O).
    fn step(self_rc: &Rc<RefCell<Inner>>) -> bool {
        let next = { self_rc.borrow_mut().ready.pop_front() };
        let task = match next {
            Some(t) => t,
            None => {
                Inner::poll_external(self_rc);
                return !self_rc.borrow().ready.is_empty();
            }
        };

        let (mut fut, waker, activation) = {
            let mut inner = self_rc.borrow_mut();
            let Some(slot) = inner.tasks.get_mut(&task) else {
                return true;
            };
            if slot.meta.terminated {
                return true;
            }
            slot.meta.state = State::Running;
            slot.meta.cycles += 1;
            inner.current = Some(task);
            let activation = inner.config.activation_or_null();
            let fut = slot.future.take();
            let waker = slot.waker.clone();
            (fut, waker, activation)
        };
        invoke_activation(&activation, |a| a.running(task));

        let Some(mut f) = fut.take() else { return true };
        let mut cx = Context::from_waker(&waker);
        let config = self_rc.borrow().config.clone();
        let poll_result = if config.catch_task_panics {
            panic::catch_unwind(AssertUnwindSafe(|| f.as_mut().poll(&mut cx)))
        } else {
            Ok(f.as_mut().poll(&mut cx))
        };

        let mut inner = self_rc.borrow_mut();
        inner.current = None;
        match poll_result {
            Ok(Poll::Pending) => {
                let still_suspended = if let Some(slot) = inner.tasks.get_mut(&task) {
                    slot.future = Some(f);
                    if slot.meta.state == State::Running {
                        // The task returned Pending without registering with
                        // any trap (shouldn't happen for well-formed trap
                        // futures, but keep it schedulable defensively).
                        slot.meta.state = State::Ready;
                        inner.ready.push_back(task);
                        false
                    } else {
                        true
                    }
                } else {
                    false
                };
                if still_suspended {
                    invoke_activation(&activation, |a| a.suspended(task));
                }
            }
            Ok(Poll::Ready(outcome)) => {
                drop(f);
                inner.terminate(task, outcome, &activation);
            }
            Err(panic_payload) => {
                drop(f);
                let msg = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "task panicked".to_string());
                inner.terminate(
                    task,
                    Err(Rc::new(UserError::new(std::io::Error::other(msg)))),
                    &activation,
                );
            }
        }
        true
    }

    fn terminate(
        &mut self,
        task: TaskId,
        outcome: TaskOutcome,
        activation: &Arc<dyn crate::config::SchedulerActivation>,
    ) {
        let (joiners, group) = {
            let Some(slot) = self.tasks.get_mut(&task) else {
                return;
            };
            slot.meta.terminated = true;
            slot.meta.state = State::Terminated;
            slot.meta.io_wait = None;
            slot.meta.timer_token = None;
            slot.meta.waiting_on = None;
            slot.result = Some(outcome);
            (slot.meta.joiners.clone(), slot.meta.group)
        };
        invoke_activation(activation, |a| a.terminated(task));
        self.wake_all(&joiners);
        if let Some(gid) = group {
            if let Some(group_state) = self.groups.get_mut(&gid) {
                group_state.completed.push(task);
                let activity = group_state.activity.clone();
                self.wake_all(&activity);
            }
        }
    }

    /// Poll external sources: expired timers and readiness events, plus
    /// anything a foreign thread queued via [`WakeQueue`]. Blocks for at
    /// most the nearest live deadline when the ready queue is empty.
    fn poll_external(self_rc: &Rc<RefCell<Inner>>) {
        let bound = {
            let mut inner = self_rc.borrow_mut();
            if !inner.ready.is_empty() {
                Some(Duration::from_secs(0))
            } else {
                match inner.timers.next_deadline() {
                    Some(deadline) => {
                        let now = inner.clock.now();
                        let remaining = (deadline - now).max(0.0);
                        Some(Duration::from_secs_f64(remaining))
                    }
                    None => None,
                }
            }
        };

        let ready_events = {
            let mut inner = self_rc.borrow_mut();
            inner.readiness.wait(bound).unwrap_or_default()
        };

        let mut inner = self_rc.borrow_mut();
        for event in ready_events {
            let holder = inner
                .tasks
                .values()
                .find(|slot| slot.meta.io_wait == Some((event.fd, event.direction)))
                .map(|slot| slot.meta.id);
            if let Some(task) = holder {
                inner.unregister_io(task);
                inner.mark_ready(task);
            }
        }

        for task in inner.wake_queue.drain() {
            if inner.tasks.contains_key(&task) {
                inner.mark_ready(task);
            }
        }

        let now = inner.clock.now();
        let expired = inner.timers.pop_expired(now);
        for (task, kind) in expired {
            match kind {
                TimerKind::Sleep => {
                    if let Some(slot) = inner.tasks.get_mut(&task) {
                        slot.meta.timer_token = None;
                    }
                    inner.mark_ready(task);
                }
                TimerKind::TimeoutFrame(frame_id) => {
                    let outcome = inner
                        .tasks
                        .get(&task)
                        .map(|slot| cancellation::classify_expiry(&slot.meta, frame_id));
                    if let Some(slot) = inner.tasks.get_mut(&task) {
                        if let Some(frame) = slot
                            .meta
                            .timeout_stack
                            .iter_mut()
                            .find(|f| f.id == frame_id)
                        {
                            frame.expired = true;
                        }
                    }
                    if let Some(outcome) = outcome {
                        if let Some(exc) = cancellation::exception_for(outcome, frame_id) {
                            inner.deliver_or_pend(task, exc);
                        }
                    }
                }
            }
        }
    }
}

/// A running or completed task, type-checked at the boundary: the spawner
/// knows `T`, the kernel stores `Box<dyn Any>`.
pub struct TaskHandle<T> {
    id: TaskId,
    kernel: Rc<RefCell<Inner>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        TaskHandle {
            id: self.id,
            kernel: self.kernel.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: 'static> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_terminated(&self) -> bool {
        self.kernel
            .borrow()
            .tasks
            .get(&self.id)
            .map(|s| s.meta.terminated)
            .unwrap_or(true)
    }

    pub fn cancelled(&self) -> bool {
        self.kernel
            .borrow()
            .tasks
            .get(&self.id)
            .map(|s| s.meta.cancelled)
            .unwrap_or(false)
    }

    /// `join()`: suspend (via the target's `joiners` `WaitQueue`) until the
    /// target terminates, then unwrap its result as `TaskError` on failure.
    /// Returns `Rc<T>` rather than `T`: the stored outcome is cloned out,
    /// not consumed, so a second `join()` (the group supervisor's internal
    /// bookkeeping, then the caller again) sees the same value.
    pub async fn join(&self) -> Result<Rc<T>, KernelError> {
        loop {
            let (terminated, joiners) = {
                let inner = self.kernel.borrow();
                let Some(slot) = inner.tasks.get(&self.id) else {
                    return Err(KernelError::Reentrant(
                        "joined task no longer exists".to_string(),
                    ));
                };
                (slot.meta.terminated, slot.meta.joiners.clone())
            };
            if terminated {
                break;
            }
            crate::trap::scheduler_wait(joiners).await?;
        }
        let inner = self.kernel.borrow();
        let slot = inner.tasks.get(&self.id).expect("checked above");
        match slot.result.clone().expect("terminated implies a result") {
            Ok(value) => Ok(value
                .downcast::<T>()
                .expect("TaskHandle<T> always downcasts to the T it was spawned with")),
            Err(cause) => Err(KernelError::task_error(cause)),
        }
    }

    /// Whether the task terminated with an `Ok` result, without downcasting
    /// it — used by `TaskGroup`'s wait-policy bookkeeping, which only needs
    /// to know success/failure, not the concrete value.
    pub(crate) fn peek_outcome(&self) -> Option<Result<(), ()>> {
        self.kernel
            .borrow()
            .tasks
            .get(&self.id)
            .and_then(|s| s.result.as_ref().map(|r| r.as_ref().map(|_| ()).map_err(|_| ())))
    }

    /// `cancel_task(t)` plus, when `blocking`, waiting for actual
    /// termination — both callers wait for termination when a second cancel
    /// joins an in-flight one.
    pub async fn cancel(&self, blocking: bool) -> bool {
        let requested = self.kernel.borrow_mut().cancel_task(self.id);
        if blocking {
            let _ = self.join().await;
        }
        requested
    }
}

/// The kernel proper: a cheap handle (`Rc` clone) around [`Inner`].
#[derive(Clone)]
pub struct Kernel {
    inner: Rc<RefCell<Inner>>,
}

impl Kernel {
    pub(crate) fn from_inner(inner: Rc<RefCell<Inner>>) -> Kernel {
        Kernel { inner }
    }

    pub fn new(config: KernelConfig) -> std::io::Result<Kernel> {
        let readiness = ReadinessSelector::new()?;
        let waker = readiness.make_waker()?;
        let wake_queue = Arc::new(WakeQueue {
            pending: Mutex::new(VecDeque::new()),
            waker,
        });
        let inner = Inner {
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            next_id: 0,
            next_frame_id: 0,
            current: None,
            clock: Clock::new(),
            timers: TimerHeap::new(),
            readiness,
            wake_queue,
            config,
            bound_thread: None,
            groups: HashMap::new(),
            next_group_id: 0,
        };
        Ok(Kernel {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    pub(crate) fn inner(&self) -> &Rc<RefCell<Inner>> {
        &self.inner
    }

    fn bind_to_this_thread(&self) -> Result<ThreadBindingGuard, KernelError> {
        let this_thread = std::thread::current().id();
        {
            let mut inner = self.inner.borrow_mut();
            match inner.bound_thread {
                Some(bound) if bound != this_thread => {
                    return Err(KernelError::Reentrant(
                        "kernel is already bound to a different OS thread".to_string(),
                    ));
                }
                Some(_) => {}
                None => inner.bound_thread = Some(this_thread),
            }
        }
        if current_kernel().is_some() {
            return Err(KernelError::Reentrant(
                "a kernel is already running on this thread (run is not reentrant)".to_string(),
            ));
        }
        CURRENT_KERNEL.with(|cell| *cell.borrow_mut() = Some(Rc::downgrade(&self.inner)));
        Ok(ThreadBindingGuard)
    }

    /// `spawn(coro, daemon=false)` — create a top-level, ungrouped task.
    pub fn spawn<F, T>(&self, fut: F, daemon: bool) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, UserError>> + 'static,
        T: 'static,
    {
        self.spawn_in(fut, daemon, None)
    }

    /// Construct a new, empty [`crate::task_group::TaskGroup`] with the
    /// given wait policy.
    pub fn task_group<T: 'static>(
        &self,
        policy: crate::task_group::WaitPolicy,
    ) -> crate::task_group::TaskGroup<T> {
        crate::task_group::TaskGroup::new(self, policy)
    }

    /// As [`Kernel::spawn`], but attaches the new task to `group` — used by
    /// `TaskGroup::spawn`/`add_task`.
    pub(crate) fn spawn_in<F, T>(
        &self,
        fut: F,
        daemon: bool,
        group: Option<TaskGroupId>,
    ) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, UserError>> + 'static,
        T: 'static,
    {
        let boxed: BoxFuture = Box::pin(async move {
            fut.await
                .map(|v| Rc::new(v) as Rc<dyn Any>)
                .map_err(Rc::new)
        });
        let id = Inner::spawn_erased(&self.inner, boxed, daemon, group);
        TaskHandle {
            id,
            kernel: self.inner.clone(),
            _marker: std::marker::PhantomData,
        }
    }

    /// `run(coro)` — drive `coro` (as the kernel's root task) to completion
    /// on this thread and return its value or propagate its exception. Not
    /// reentrant; binds this `Kernel` to the calling thread on first use.
    pub fn run<F, T>(&self, coro: F) -> Result<T, KernelError>
    where
        F: Future<Output = Result<T, UserError>> + 'static,
        T: 'static,
    {
        let _guard = self.bind_to_this_thread()?;
        let activation = self.inner.borrow().config.activation_or_null();
        invoke_activation(&activation, |a| a.activate());
        let root = self.spawn(coro, false);
        loop {
            if root.is_terminated() {
                break;
            }
            Inner::step(&self.inner);
        }
        // The root handle never escapes `run`, so once its slot's result is
        // taken (rather than cloned, as the public `join()` does) the `Rc`
        // it returns is uniquely held and unwraps without cloning `T`.
        let outcome = self
            .inner
            .borrow_mut()
            .tasks
            .get_mut(&root.id)
            .expect("root task just terminated")
            .result
            .take()
            .expect("terminated implies a result");
        match outcome {
            Ok(value) => {
                let typed = value
                    .downcast::<T>()
                    .expect("root task always downcasts to the T it was spawned with");
                Ok(Rc::try_unwrap(typed)
                    .unwrap_or_else(|_| unreachable!("root task handle is never cloned")))
            }
            Err(cause) => Err(KernelError::task_error(cause)),
        }
    }

    /// Cancel every remaining non-terminated task — used when the kernel is
    /// dropped or explicitly `close()`d as a scoped resource.
    pub fn close(&self) {
        let ids: Vec<TaskId> = {
            let inner = self.inner.borrow();
            inner
                .tasks
                .values()
                .filter(|s| !s.meta.terminated)
                .map(|s| s.meta.id)
                .collect()
        };
        for id in ids {
            self.inner.borrow_mut().cancel_task(id);
        }
        // Drive remaining cancellations to completion.
        loop {
            let pending = self
                .inner
                .borrow()
                .tasks
                .values()
                .any(|s| !s.meta.terminated);
            if !pending {
                break;
            }
            Inner::step(&self.inner);
        }
    }
}

/// Drive a future that is known to resolve on its very first poll — the
/// shape `join()` on an already-terminated handle always takes — without
/// pulling in a general-purpose executor. Used by `TaskGroup::next_result`
/// and similar call sites that already know termination happened. Panics if
/// the assumption doesn't hold.
pub(crate) fn poll_to_completion<F: Future>(fut: F) -> F::Output {
    use std::task::{RawWaker, RawWakerVTable};

    fn noop(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);

    let raw = RawWaker::new(std::ptr::null(), &VTABLE);
    let waker = unsafe { Waker::from_raw(raw) };
    let mut cx = Context::from_waker(&waker);
    let mut fut = Box::pin(fut);
    match fut.as_mut().poll(&mut cx) {
        Poll::Ready(v) => v,
        Poll::Pending => unreachable!("join() on an already-terminated task must resolve eagerly"),
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if Rc::strong_count(&self.inner) == 1 {
            self.close();
        }
    }
}
