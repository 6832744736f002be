//! `timeout_after` / `timeout_at` / `ignore_after` / `ignore_at`: the
//! user-facing scopes built over the per-task timeout stack and
//! [`crate::cancellation::classify_expiry`].
//!
//! The kernel classifies an expiry the instant a deadline fires, injecting
//! either `TaskTimeout` (this frame owns the outcome) or
//! `TimeoutCancellationError` (some outer frame fired first) into whatever
//! trap the task happens to be suspended in. These wrappers are what turns
//! that injection-time classification into the three outcomes a caller can
//! branch on as the error unwinds back through each nested scope:
//!
//! - exactly mine → `TaskTimeout` propagates unchanged (still catchable by
//!   the code inside the scope; `timeout_after` itself never swallows it).
//! - an outer deadline fired while I was pending → reclassified to
//!   `TaskTimeout` once unwinding reaches the scope that actually owns it,
//!   so code *outside* that scope sees the same exception type it would
//!   have seen had there been no nesting at all.
//! - an inner `TaskTimeout` reached me without anything inside having
//!   caught it → `UncaughtTimeoutError`, naming this scope as the frame it
//!   escaped past.

use std::future::Future;

use crate::cancellation::TimeoutKind;
use crate::error::{CancellationError, KernelError, TimeoutFrameId};
use crate::kernel::current_kernel;

enum Deadline {
    After(f64),
    At(f64),
}

/// Push a frame, run `fut`, pop the frame, and reclassify whatever error (if
/// any) comes out so it reads correctly from this scope's point of view.
/// Returns the frame id alongside the outcome so callers that want to
/// additionally swallow "exactly mine" (`ignore_after`/`ignore_at`) can
/// check it without re-deriving anything.
async fn run_framed<F, T>(kind: TimeoutKind, deadline: Deadline, fut: F) -> (Result<T, KernelError>, TimeoutFrameId)
where
    F: Future<Output = Result<T, KernelError>>,
{
    let kernel = current_kernel().expect(
        "timeout_after/timeout_at/ignore_after/ignore_at invoked with no kernel bound to this thread",
    );
    let seconds = match deadline {
        Deadline::After(s) => s,
        Deadline::At(d) => (d - kernel.borrow().clock_now()).max(0.0),
    };
    let frame_id = kernel.borrow_mut().push_timeout_frame(seconds, kind);
    let result = fut.await;
    kernel.borrow_mut().pop_timeout_frame(frame_id);
    (reclassify(result, frame_id), frame_id)
}

/// Re-derive the three-way outcome from whatever the wrapped future actually
/// returned, relative to `frame_id` (the scope doing the reclassifying).
fn reclassify<T>(result: Result<T, KernelError>, frame_id: TimeoutFrameId) -> Result<T, KernelError> {
    match result {
        Err(KernelError::Cancelled(CancellationError::TaskTimeout { frame })) if frame == frame_id => {
            // Exactly mine, unhandled by anything inside the scope: keep
            // propagating it as-is so an enclosing `except TaskTimeout`
            // equivalent still matches.
            Err(KernelError::Cancelled(CancellationError::TaskTimeout { frame }))
        }
        Err(KernelError::Cancelled(CancellationError::TaskTimeout { .. })) => {
            // An inner frame's TaskTimeout reached me without being caught
            // anywhere inside.
            Err(KernelError::UncaughtTimeoutError { frame: frame_id })
        }
        Err(KernelError::Cancelled(CancellationError::TimeoutCancellationError { outer_frame }))
            if outer_frame == frame_id =>
        {
            // The deadline that actually fired was mine, but something
            // nested deeper was pending when it happened. Now that
            // unwinding has reached the scope that owns it, it reads as a
            // plain TaskTimeout to anything outside this scope.
            Err(KernelError::Cancelled(CancellationError::TaskTimeout { frame: frame_id }))
        }
        other => other,
    }
}

/// `timeout_after(s)`: run `fut`, raising `TaskTimeout` if it hasn't
/// completed within `s` seconds. Never swallows its own expiry — catch
/// `KernelError::Cancelled(CancellationError::TaskTimeout { .. })` inside
/// `fut` to continue past it.
pub async fn timeout_after<F, T>(seconds: f64, fut: F) -> Result<T, KernelError>
where
    F: Future<Output = Result<T, KernelError>>,
{
    run_framed(TimeoutKind::Timeout, Deadline::After(seconds), fut)
        .await
        .0
}

/// As [`timeout_after`], but measured against an absolute deadline rather
/// than a relative duration.
pub async fn timeout_at<F, T>(deadline: f64, fut: F) -> Result<T, KernelError>
where
    F: Future<Output = Result<T, KernelError>>,
{
    run_framed(TimeoutKind::Timeout, Deadline::At(deadline), fut)
        .await
        .0
}

/// `ignore_after(s)`: run `fut`, returning `Ok(None)` instead of raising if
/// it hasn't completed within `s` seconds — the "expired" observable is the
/// `None` case. A non-timeout error (a user exception, an outer timeout, an
/// uncaught inner one) still propagates.
pub async fn ignore_after<F, T>(seconds: f64, fut: F) -> Result<Option<T>, KernelError>
where
    F: Future<Output = Result<T, KernelError>>,
{
    swallow_own_expiry(run_framed(TimeoutKind::Ignore, Deadline::After(seconds), fut).await)
}

/// As [`ignore_after`], but measured against an absolute deadline.
pub async fn ignore_at<F, T>(deadline: f64, fut: F) -> Result<Option<T>, KernelError>
where
    F: Future<Output = Result<T, KernelError>>,
{
    swallow_own_expiry(run_framed(TimeoutKind::Ignore, Deadline::At(deadline), fut).await)
}

fn swallow_own_expiry<T>(
    (result, frame_id): (Result<T, KernelError>, TimeoutFrameId),
) -> Result<Option<T>, KernelError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(KernelError::Cancelled(CancellationError::TaskTimeout { frame })) if frame == frame_id => Ok(None),
        Err(other) => Err(other),
    }
}
