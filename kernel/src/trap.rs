//! Blocking traps as first-class futures.
//!
//! Each blocking trap is its own `Future`. A task body `.await`s one of
//! these at a time; the `.await` point *is* the cancellation point. Every
//! `poll` call — first or subsequent — starts by checking the owning
//! task's pending cancellation, exactly matching "every blocking trap
//! checks for pending cancellation before suspending and after being
//! rescheduled". The kernel's run loop is what actually moves a task back
//! onto the ready queue when its registered condition fires; these futures
//! only need to tell, on being re-polled, whether that happened normally or
//! via cancellation.

use std::cell::RefCell;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::{Direction, KernelError};
use crate::kernel::Inner;
use crate::wait_queue::WaitQueue;

fn current_kernel() -> Rc<RefCell<Inner>> {
    crate::kernel::current_kernel().expect(
        "trap invoked with no kernel bound to this thread — traps may only be awaited from \
         inside a task body running under Kernel::run",
    )
}

/// `read_wait(fd)`.
pub struct ReadWait {
    kernel: Rc<RefCell<Inner>>,
    fd: RawFd,
    registered: bool,
}

pub fn read_wait(fd: RawFd) -> ReadWait {
    ReadWait {
        kernel: current_kernel(),
        fd,
        registered: false,
    }
}

impl Future for ReadWait {
    type Output = Result<(), KernelError>;
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.kernel.borrow_mut();
        let task = inner.current();
        if let Some(err) = inner.take_pending_cancellation(task) {
            if this.registered {
                inner.unregister_io(task);
                this.registered = false;
            }
            return Poll::Ready(Err(err));
        }
        if !this.registered {
            match inner.register_io(task, this.fd, Direction::Read) {
                Ok(()) => {
                    this.registered = true;
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(e)),
            }
        } else {
            this.registered = false;
            Poll::Ready(Ok(()))
        }
    }
}

impl Drop for ReadWait {
    fn drop(&mut self) {
        if self.registered {
            if let Ok(mut inner) = self.kernel.try_borrow_mut() {
                let task = inner.current();
                inner.unregister_io(task);
            }
        }
    }
}

/// `write_wait(fd)`.
pub struct WriteWait {
    kernel: Rc<RefCell<Inner>>,
    fd: RawFd,
    registered: bool,
}

pub fn write_wait(fd: RawFd) -> WriteWait {
    WriteWait {
        kernel: current_kernel(),
        fd,
        registered: false,
    }
}

impl Future for WriteWait {
    type Output = Result<(), KernelError>;
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.kernel.borrow_mut();
        let task = inner.current();
        if let Some(err) = inner.take_pending_cancellation(task) {
            if this.registered {
                inner.unregister_io(task);
                this.registered = false;
            }
            return Poll::Ready(Err(err));
        }
        if !this.registered {
            match inner.register_io(task, this.fd, Direction::Write) {
                Ok(()) => {
                    this.registered = true;
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(e)),
            }
        } else {
            this.registered = false;
            Poll::Ready(Ok(()))
        }
    }
}

impl Drop for WriteWait {
    fn drop(&mut self) {
        if self.registered {
            if let Ok(mut inner) = self.kernel.try_borrow_mut() {
                let task = inner.current();
                inner.unregister_io(task);
            }
        }
    }
}

/// `sleep(deadline)`.
pub struct Sleep {
    kernel: Rc<RefCell<Inner>>,
    deadline: f64,
    registered: bool,
}

/// Sleep for `seconds`, relative to the kernel clock.
pub fn sleep(seconds: f64) -> Sleep {
    let kernel = current_kernel();
    let deadline = kernel.borrow().clock_now() + seconds;
    Sleep {
        kernel,
        deadline,
        registered: false,
    }
}

/// Force a yield to the next ready task without actually waiting: `sleep(now)`.
pub fn reschedule() -> Sleep {
    let kernel = current_kernel();
    let now = kernel.borrow().clock_now();
    Sleep {
        kernel,
        deadline: now,
        registered: false,
    }
}

impl Future for Sleep {
    type Output = Result<(), KernelError>;
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.kernel.borrow_mut();
        let task = inner.current();
        if let Some(err) = inner.take_pending_cancellation(task) {
            if this.registered {
                inner.unregister_sleep(task);
                this.registered = false;
            }
            return Poll::Ready(Err(err));
        }
        if !this.registered {
            inner.register_sleep(task, this.deadline);
            this.registered = true;
            Poll::Pending
        } else {
            this.registered = false;
            Poll::Ready(Ok(()))
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if self.registered {
            if let Ok(mut inner) = self.kernel.try_borrow_mut() {
                let task = inner.current();
                inner.unregister_sleep(task);
            }
        }
    }
}

/// `scheduler_wait(wq, state_name)` — suspend on a `WaitQueue` shared with a
/// sync primitive (`Event`, `Lock`, `Semaphore`, `Condition`, `Queue`, or a
/// task's `joiners`).
pub struct SchedulerWait {
    kernel: Rc<RefCell<Inner>>,
    wq: Rc<RefCell<WaitQueue>>,
    suspended: bool,
}

pub fn scheduler_wait(wq: Rc<RefCell<WaitQueue>>) -> SchedulerWait {
    SchedulerWait {
        kernel: current_kernel(),
        wq,
        suspended: false,
    }
}

impl Future for SchedulerWait {
    type Output = Result<(), KernelError>;
    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.kernel.borrow_mut();
        let task = inner.current();
        if let Some(err) = inner.take_pending_cancellation(task) {
            if this.suspended {
                this.wq.borrow_mut().cancel_wait(task);
                inner.clear_wait(task);
                this.suspended = false;
            }
            return Poll::Ready(Err(err));
        }
        if !this.suspended {
            inner.suspend_on(task, &this.wq);
            this.suspended = true;
            Poll::Pending
        } else {
            this.suspended = false;
            Poll::Ready(Ok(()))
        }
    }
}

impl Drop for SchedulerWait {
    fn drop(&mut self) {
        if self.suspended {
            self.wq.borrow_mut().cancel_wait(
                self.kernel
                    .try_borrow()
                    .map(|i| i.current())
                    .unwrap_or_else(|_| crate::task::TaskId::from_raw(0)),
            );
        }
    }
}

// --- synchronous introspection traps --------------------------------------
//
// `get_kernel`/`get_current`/`clock`/`io_waiting(fd)`: none of these yield to
// other tasks, so unlike everything above they are plain functions rather
// than futures, and none of them are cancellation points.

/// `clock()` — the kernel's monotonic time, in seconds since its epoch.
pub fn clock() -> f64 {
    current_kernel().borrow().clock_now()
}

/// `get_kernel()` — the ambient kernel for the task currently running.
pub fn get_kernel() -> crate::kernel::Kernel {
    crate::kernel::Kernel::from_inner(current_kernel())
}

/// `get_current()` — the id of the task currently running.
pub fn current_task() -> crate::task::TaskId {
    current_kernel().borrow().current()
}

/// `io_waiting(fd)` — whether some task is currently registered to read
/// and/or write `fd`, as `(reading, writing)`.
pub fn io_waiting(fd: RawFd) -> (bool, bool) {
    current_kernel().borrow().io_waiting(fd)
}

/// `future_wait(fut)` — suspend until an externally-driven future (a
/// worker-pool result, a foreign-thread bridge) completes. Unlike the other
/// traps this delegates waking entirely to the wrapped future's own waker
/// machinery, which for cross-thread completions is backed by the kernel's
/// `WakeQueue`/`mio::Waker` pair: once registered, the task is re-readied by
/// the `wake_queue` drain in `Inner::poll_external`, not by this future
/// itself.
pub struct FutureWait<F> {
    kernel: Rc<RefCell<Inner>>,
    inner: F,
    suspended: bool,
}

pub fn future_wait<F: Future>(fut: F) -> FutureWait<F> {
    FutureWait {
        kernel: current_kernel(),
        inner: fut,
        suspended: false,
    }
}

impl<F: Future + Unpin> Future for FutureWait<F> {
    type Output = Result<F::Output, KernelError>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let task = {
            let mut inner = this.kernel.borrow_mut();
            let task = inner.current();
            if let Some(err) = inner.take_pending_cancellation(task) {
                this.suspended = false;
                return Poll::Ready(Err(err));
            }
            task
        };
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Ready(v) => {
                this.suspended = false;
                Poll::Ready(Ok(v))
            }
            Poll::Pending => {
                if !this.suspended {
                    this.kernel.borrow_mut().register_future_wait(task);
                    this.suspended = true;
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::config::KernelConfig;
    use crate::error::UserError;
    use crate::kernel::Kernel;

    fn to_user_error(e: crate::error::KernelError) -> UserError {
        UserError::new(std::io::Error::other(e.to_string()))
    }

    #[test]
    fn introspection_traps_see_the_running_task_and_advancing_clock() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let run_kernel = kernel.clone();
        let result = kernel.run(async move {
            let before = super::clock();
            let root = super::current_task();
            let spawned = run_kernel.spawn(
                async {
                    let child = super::current_task();
                    Ok::<_, UserError>(child)
                },
                false,
            );
            let child = *spawned.join().await.map_err(to_user_error)?;
            assert_ne!(root, child, "child task observes its own id, not the parent's");
            super::sleep(0.0).await.map_err(to_user_error)?;
            let after = super::clock();
            assert!(after >= before, "clock() must not go backward");
            assert!(Rc::ptr_eq(super::get_kernel().inner(), run_kernel.inner()));
            Ok::<_, UserError>(())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn io_waiting_reports_registered_direction() {
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let run_kernel = kernel.clone();
        let (read_end, _write_end) = UnixStream::pair().unwrap();
        let fd = read_end.as_raw_fd();
        let result = kernel.run(async move {
            assert_eq!(super::io_waiting(fd), (false, false));
            let reader = run_kernel.spawn(
                async move {
                    super::read_wait(fd).await.map_err(to_user_error)?;
                    Ok::<_, UserError>(())
                },
                false,
            );
            super::sleep(0.0).await.map_err(to_user_error)?;
            assert_eq!(super::io_waiting(fd), (true, false));
            reader.cancel(true).await;
            assert_eq!(super::io_waiting(fd), (false, false));
            Ok::<_, UserError>(())
        });
        assert!(result.is_ok());
    }
}
