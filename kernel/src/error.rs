//! The exception taxonomy the kernel raises at trap boundaries.
//!
//! Every member is reachable through [`KernelError`]; the cancellation family
//! is nested under [`CancellationError`] so call sites can match on "any
//! cancellation" or drill into which variant actually fired, mirroring the
//! abstract `CancelledError` base the source exposes.

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

/// The direction a resource was busy in, used by [`KernelError::ResourceBusy`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// One frame of a task's nested-timeout stack, referenced by the cancellation
/// family so a caught `TaskTimeout` can be matched against the frame that
/// raised it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimeoutFrameId(pub(crate) u64);

impl fmt::Display for TimeoutFrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The cancellation family: everything that is a *request to stop*, as
/// opposed to a genuine user error. All three outcomes of nested-timeout
/// resolution (exactly-mine, some-outer-timeout, inner-escaped) are
/// distinguishable variants here, per the nested timeout rules.
#[derive(Error, Debug, Clone)]
pub enum CancellationError {
    /// Cancellation requested directly, via `cancel_task` or group supervision.
    #[error("task cancelled")]
    TaskCancelled,

    /// The innermost timeout frame that owns this await point expired.
    #[error("task timeout (frame {frame})")]
    TaskTimeout { frame: TimeoutFrameId },

    /// A timeout fired, but for a frame outer to the one currently awaiting;
    /// "not yours" — must not be caught by an inner `except TaskTimeout`.
    #[error("an outer timeout fired while an inner operation was pending (frame {outer_frame})")]
    TimeoutCancellationError { outer_frame: TimeoutFrameId },
}

impl CancellationError {
    pub fn frame(&self) -> Option<TimeoutFrameId> {
        match self {
            CancellationError::TaskCancelled => None,
            CancellationError::TaskTimeout { frame } => Some(*frame),
            CancellationError::TimeoutCancellationError { outer_frame } => Some(*outer_frame),
        }
    }
}

/// The full exception taxonomy exported at the kernel boundary.
#[derive(Error, Debug, Clone)]
pub enum KernelError {
    /// Any member of the cancellation family.
    #[error(transparent)]
    Cancelled(#[from] CancellationError),

    /// A `TaskTimeout` belonging to an inner frame escaped an outer frame
    /// without being caught anywhere inside it.
    #[error("an inner timeout escaped uncaught past frame {frame}")]
    UncaughtTimeoutError { frame: TimeoutFrameId },

    /// A second task attempted to read- or write-wait on an fd already
    /// claimed in that direction.
    #[error("{direction} resource busy on fd {fd}")]
    ResourceBusy { fd: i32, direction: Direction },

    /// A synchronous-only operation was attempted from inside the kernel's
    /// run loop (e.g. a blocking syscall issued by task code directly).
    #[error("operation requires a synchronous (non-kernel) thread: {0}")]
    SyncIOError(String),

    /// An operation that only makes sense inside a running task was invoked
    /// with no task currently running (no current kernel context).
    #[error("operation is only valid inside a running task: {0}")]
    AsyncOnlyError(String),

    /// A child task terminated with a user exception; carries the original
    /// so `join()`/`result()` can re-raise with the cause inspectable via
    /// [`KernelError::cause`]. Held by `Rc` rather than consumed, so a
    /// task's result stays retrievable for as long as any handle to it is
    /// still alive — `Rc<UserError>` doesn't itself satisfy `std::error::Error`,
    /// so this is a plain field rather than `#[source]`.
    #[error("task failed: {message}")]
    TaskError { message: String, cause: Rc<UserError> },

    /// Kernel was asked to run while already running on this thread, or a
    /// group was joined twice, or similar programmer-error misuse.
    #[error("kernel misuse: {0}")]
    Reentrant(String),
}

impl KernelError {
    pub fn task_cancelled() -> KernelError {
        KernelError::Cancelled(CancellationError::TaskCancelled)
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, KernelError::Cancelled(_))
    }

    /// Wrap a terminated task's user exception the way `join()` does.
    pub fn task_error(cause: Rc<UserError>) -> KernelError {
        KernelError::TaskError {
            message: cause.to_string(),
            cause,
        }
    }

    /// The original user exception behind a [`KernelError::TaskError`], if
    /// this is one.
    pub fn cause(&self) -> Option<&UserError> {
        match self {
            KernelError::TaskError { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

/// An exception raised by user task code, as opposed to one the kernel
/// itself injects. Boxed dynamically so tasks can fail with any
/// `std::error::Error` type; `join()` wraps this as [`KernelError::TaskError`].
#[derive(Debug)]
pub struct UserError(pub Box<dyn std::error::Error + Send + Sync + 'static>);

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for UserError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl UserError {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        UserError(Box::new(err))
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn frame(n: u64) -> TimeoutFrameId {
        TimeoutFrameId(n)
    }

    #[test_case(KernelError::task_cancelled(), true; "task cancelled is a cancellation")]
    #[test_case(KernelError::Cancelled(CancellationError::TaskTimeout { frame: frame(1) }), true; "task timeout is a cancellation")]
    #[test_case(KernelError::Cancelled(CancellationError::TimeoutCancellationError { outer_frame: frame(1) }), true; "outer timeout is a cancellation")]
    #[test_case(KernelError::UncaughtTimeoutError { frame: frame(1) }, false; "uncaught timeout is not a cancellation")]
    #[test_case(KernelError::ResourceBusy { fd: 3, direction: Direction::Read }, false; "resource busy is not a cancellation")]
    #[test_case(KernelError::Reentrant("double run".into()), false; "reentrant misuse is not a cancellation")]
    fn is_cancellation_matches_only_the_cancellation_family(err: KernelError, expected: bool) {
        assert_eq!(err.is_cancellation(), expected);
    }

    #[test]
    fn task_error_exposes_its_cause() {
        let cause = Rc::new(UserError::new(std::io::Error::other("bad")));
        let err = KernelError::task_error(cause.clone());
        assert_eq!(err.cause().unwrap().to_string(), "bad");
    }
}
