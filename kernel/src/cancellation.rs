//! Timeout frames and the nested-timeout resolution rules.
//!
//! A task's timeout stack records every live `timeout_after`/`timeout_at`
//! (and `ignore_after`/`ignore_at`) scope it is currently inside, innermost
//! last. When the kernel's effective deadline for a task (the minimum live
//! deadline across the stack) expires, [`classify_expiry`] decides which of
//! the three distinguishable outcomes applies.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use crate::error::{CancellationError, TimeoutFrameId};
use crate::kernel::Inner;
use crate::task::{Task, TaskId};
use crate::timer_heap::TimerToken;

/// Whether a frame converts its own expiry into a catchable `TaskTimeout`
/// that it silently swallows (`Ignore`), or lets it propagate (`Timeout`).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimeoutKind {
    Timeout,
    Ignore,
}

/// One entry in a task's nested-timeout stack.
#[derive(Debug)]
pub struct TimeoutFrame {
    pub id: TimeoutFrameId,
    pub deadline: f64,
    pub kind: TimeoutKind,
    /// Set once this frame's deadline has fired, so a stale frame left on
    /// the stack (e.g. behind a deeper one still pending) is excluded from
    /// `innermost_frame` without needing to be popped out of order. Mirrors
    /// the TimerHeap generation trick at the per-task-frame level.
    pub expired: bool,
    /// The `TimerHeap` token backing this frame's deadline, so popping the
    /// frame early (the scope exits before the deadline) cancels the entry
    /// in O(1) instead of leaving it to be discarded lazily.
    pub timer_token: TimerToken,
}

impl TimeoutFrame {
    pub fn new(
        id: TimeoutFrameId,
        deadline: f64,
        kind: TimeoutKind,
        timer_token: TimerToken,
    ) -> TimeoutFrame {
        TimeoutFrame {
            id,
            deadline,
            kind,
            expired: false,
            timer_token,
        }
    }
}

/// The three outcomes a caller must be able to branch on when a deadline on
/// their task's timeout stack expires.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExpiryOutcome {
    /// The expired frame is the innermost live one: deliver `TaskTimeout`
    /// The caller (the `timeout_after`/`ignore_after` wrapper owning this
    /// frame) distinguishes by `kind` whether to propagate the resulting
    /// `TaskTimeout` or swallow it into an `expired` observable.
    Owned { kind: TimeoutKind },
    /// The expired frame is outer relative to a still-live inner frame:
    /// deliver `TimeoutCancellationError` instead — "a timeout fired, but
    /// not yours".
    Outer,
}

/// Decide how the expiry of `expired` should be injected into `task`.
/// `expired` must still be present on `task`'s timeout stack (the TimerHeap
/// popped a live token referencing it).
pub fn classify_expiry(task: &Task, expired: TimeoutFrameId) -> ExpiryOutcome {
    match task.innermost_frame() {
        Some(frame) if frame.id == expired => ExpiryOutcome::Owned { kind: frame.kind },
        _ => ExpiryOutcome::Outer,
    }
}

/// Build the exception to inject for a given outcome. The kernel always
/// injects something — even for an `Ignore` frame's own expiry — because the
/// task's currently-pending trap (e.g. a 1000s `sleep`) must actually stop
/// waiting; it is the owning `ignore_after` wrapper, one layer up in
/// `crate::timeout`, that swallows a matching `TaskTimeout` into `None`
/// instead of propagating it.
pub fn exception_for(outcome: ExpiryOutcome, expired: TimeoutFrameId) -> Option<CancellationError> {
    match outcome {
        ExpiryOutcome::Owned { .. } => Some(CancellationError::TaskTimeout { frame: expired }),
        ExpiryOutcome::Outer => Some(CancellationError::TimeoutCancellationError {
            outer_frame: expired,
        }),
    }
}

/// A held `disable_cancellation` shield for one task. Dropping it pops the
/// shield unconditionally, including on an unwinding drop (the future it
/// guards was itself cancelled-out from an enclosing scope), so the depth
/// counter never leaks a level.
struct ShieldGuard {
    kernel: Rc<RefCell<Inner>>,
    task: TaskId,
}

impl ShieldGuard {
    fn enter() -> ShieldGuard {
        let kernel = crate::kernel::current_kernel().expect(
            "disable_cancellation invoked with no kernel bound to this thread",
        );
        let task = {
            let mut inner = kernel.borrow_mut();
            let task = inner.current();
            inner.push_shield(task);
            task
        };
        ShieldGuard { kernel, task }
    }
}

impl Drop for ShieldGuard {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.kernel.try_borrow_mut() {
            inner.pop_shield(self.task);
        }
    }
}

/// Run `fut` with cancellation delivery disabled for this task (a
/// "shielded region"). A cancellation requested while the shield is held
/// stays pending — it is neither lost nor delivered —
/// and is raised at the task's next blocking trap once the shield lifts.
/// Nestable: an inner `disable_cancellation` inside an outer one simply adds
/// to the depth; cancellation stays blocked until every level has exited.
pub async fn disable_cancellation<F: Future>(fut: F) -> F::Output {
    let _guard = ShieldGuard::enter();
    fut.await
}

/// `check_cancellation()` — the pending exception for the current task, if
/// any, without consuming it.
pub fn check_cancellation() -> Option<CancellationError> {
    let kernel = crate::kernel::current_kernel()
        .expect("check_cancellation invoked with no kernel bound to this thread");
    let inner = kernel.borrow();
    let task = inner.current();
    inner.peek_pending_cancellation(task)
}

/// `check_cancellation(exc_type)` — consume the pending exception only if
/// `matches` accepts it; otherwise it is left pending for ordinary delivery
/// at the next blocking trap.
pub fn check_cancellation_if<F>(matches: F) -> Option<CancellationError>
where
    F: FnOnce(&CancellationError) -> bool,
{
    let kernel = crate::kernel::current_kernel()
        .expect("check_cancellation invoked with no kernel bound to this thread");
    let mut inner = kernel.borrow_mut();
    let task = inner.current();
    inner.clear_pending_cancellation_if(task, matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u64, deadline: f64, kind: TimeoutKind) -> TimeoutFrame {
        TimeoutFrame::new(TimeoutFrameId(id), deadline, kind, TimerToken::default())
    }

    fn task_with_stack(stack: Vec<TimeoutFrame>) -> Task {
        let mut task = Task::new(TaskId::from_raw(0), false);
        task.timeout_stack = stack;
        task
    }

    #[test]
    fn innermost_expiry_is_owned() {
        let task = task_with_stack(vec![frame(1, 5.0, TimeoutKind::Timeout)]);
        let outcome = classify_expiry(&task, TimeoutFrameId(1));
        assert_eq!(
            outcome,
            ExpiryOutcome::Owned {
                kind: TimeoutKind::Timeout
            }
        );
    }

    #[test]
    fn outer_expiry_while_inner_live_is_outer() {
        // outer(s=1) pushed first, inner(s=5) pushed second: innermost live
        // frame is the inner one, so the outer frame expiring is "not yours".
        let task = task_with_stack(vec![
            frame(1, 1.0, TimeoutKind::Timeout),
            frame(2, 5.0, TimeoutKind::Timeout),
        ]);
        let outcome = classify_expiry(&task, TimeoutFrameId(1));
        assert_eq!(outcome, ExpiryOutcome::Outer);
    }

    #[test]
    fn ignore_frame_still_injects_for_the_kernel_to_stop_waiting() {
        let task = task_with_stack(vec![frame(1, 1.0, TimeoutKind::Ignore)]);
        let outcome = classify_expiry(&task, TimeoutFrameId(1));
        assert!(matches!(
            exception_for(outcome, TimeoutFrameId(1)),
            Some(CancellationError::TaskTimeout { .. })
        ));
    }

    #[test]
    fn expired_frames_are_excluded_from_innermost_search() {
        let mut stack = vec![
            frame(1, 1.0, TimeoutKind::Timeout),
            frame(2, 5.0, TimeoutKind::Timeout),
        ];
        stack[1].expired = true; // the inner frame already resolved.
        let task = task_with_stack(stack);
        let outcome = classify_expiry(&task, TimeoutFrameId(1));
        assert_eq!(
            outcome,
            ExpiryOutcome::Owned {
                kind: TimeoutKind::Timeout
            }
        );
    }
}
