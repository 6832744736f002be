//! `UniversalQueue` (`SPEC_FULL.md` §4.9): the one primitive usable from
//! both kernel tasks and foreign OS threads. The thread side blocks on a
//! real OS mutex/condvar (`parking_lot`); the kernel side suspends via
//! [`crate::trap::future_wait`], whose `Context::waker()` is already the
//! per-task `TaskWaker` that routes through the kernel's `WakeQueue` and
//! `mio::Waker` — the same bridge `read_wait`/`write_wait` ride, just
//! reached through a plain `Future` instead of readiness registration, so
//! no separate self-pipe is needed for the kernel-side wakeup.
//!
//! An optional loopback fd (`withfd`) is for a *foreign* event loop that
//! wants to notice queue activity without touching this kernel's own
//! selector: a sentinel byte is written to one end of a `UnixStream` pair
//! on every `put`, and the other end's fd is handed back to the caller.

use std::collections::VecDeque;
use std::future::Future;
use std::io::Write;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::pin::Pin;
use std::sync::{Condvar, Mutex as StdMutex};
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    kernel_waker: Mutex<Option<Waker>>,
    thread_cond: Condvar,
    thread_guard: StdMutex<()>,
    closed: Mutex<bool>,
    loopback_write: Mutex<Option<UnixStream>>,
}

/// A queue any combination of kernel tasks and foreign OS threads may
/// `put`/`get` on. Unbounded: `put` never blocks.
pub struct UniversalQueue<T> {
    shared: std::sync::Arc<Shared<T>>,
}

impl<T> Clone for UniversalQueue<T> {
    fn clone(&self) -> Self {
        UniversalQueue {
            shared: self.shared.clone(),
        }
    }
}

impl<T> UniversalQueue<T> {
    pub fn new() -> UniversalQueue<T> {
        UniversalQueue {
            shared: std::sync::Arc::new(Shared {
                items: Mutex::new(VecDeque::new()),
                kernel_waker: Mutex::new(None),
                thread_cond: Condvar::new(),
                thread_guard: StdMutex::new(()),
                closed: Mutex::new(false),
                loopback_write: Mutex::new(None),
            }),
        }
    }

    /// As [`UniversalQueue::new`], but also opens a loopback fd pair: the
    /// write end is kept internally and fed one sentinel byte per `put`;
    /// the read end's fd is returned for an external event loop to poll.
    pub fn with_loopback_fd() -> std::io::Result<(UniversalQueue<T>, RawFd)> {
        use std::os::unix::io::IntoRawFd;
        let (read_end, write_end) = UnixStream::pair()?;
        let queue = UniversalQueue::new();
        *queue.shared.loopback_write.lock() = Some(write_end);
        Ok((queue, read_end.into_raw_fd()))
    }

    fn wake_kernel_side(&self) {
        if let Some(waker) = self.shared.kernel_waker.lock().take() {
            waker.wake();
        }
    }

    fn notify_thread_side(&self) {
        self.shared.thread_cond.notify_one();
    }

    fn ping_loopback(&self) {
        if let Some(stream) = self.shared.loopback_write.lock().as_mut() {
            let _ = stream.write_all(b"\0");
        }
    }

    /// Push an item. Callable from either a kernel task or a foreign
    /// thread — it never blocks either way.
    pub fn put(&self, item: T) {
        self.shared.items.lock().push_back(item);
        self.wake_kernel_side();
        self.notify_thread_side();
        self.ping_loopback();
    }

    /// Pop an item from kernel-task code, suspending the task (not the OS
    /// thread) until one is available or the queue is shut down. `Ok(None)`
    /// means the queue was shut down while empty; `Err` means the task
    /// itself was cancelled while waiting.
    pub async fn get(&self) -> Result<Option<T>, crate::error::KernelError> {
        crate::trap::future_wait(GetFuture {
            shared: self.shared.clone(),
        })
        .await
    }

    /// Pop an item from a foreign OS thread, blocking that thread (via a
    /// real condvar, not a kernel suspension) until one is available or the
    /// queue is shut down.
    pub fn get_blocking(&self) -> Option<T> {
        loop {
            if let Some(item) = self.shared.items.lock().pop_front() {
                return Some(item);
            }
            if *self.shared.closed.lock() {
                return None;
            }
            let guard = self.shared.thread_guard.lock().unwrap();
            let _ = self
                .shared
                .thread_cond
                .wait_timeout(guard, std::time::Duration::from_millis(50))
                .unwrap();
        }
    }

    /// Mark the queue closed: every waiter (kernel-side and thread-side) is
    /// woken and sees `None` once drained. Items already queued are still
    /// delivered; a `put` racing the shutdown is accepted (decided in
    /// `DESIGN.md`) rather than silently dropped, since the caller has no
    /// way to learn that it was discarded.
    pub fn shutdown(&self) {
        *self.shared.closed.lock() = true;
        self.wake_kernel_side();
        self.shared.thread_cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.lock()
    }

    pub fn len(&self) -> usize {
        self.shared.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.items.lock().is_empty()
    }
}

impl<T> Default for UniversalQueue<T> {
    fn default() -> Self {
        UniversalQueue::new()
    }
}

struct GetFuture<T> {
    shared: std::sync::Arc<Shared<T>>,
}

impl<T> Future for GetFuture<T> {
    type Output = Option<T>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if let Some(item) = this.shared.items.lock().pop_front() {
            return Poll::Ready(Some(item));
        }
        if *this.shared.closed.lock() {
            return Poll::Ready(None);
        }
        *this.shared.kernel_waker.lock() = Some(cx.waker().clone());
        // Re-check after registering the waker: a put/shutdown that ran
        // between the first check and the lock above must not be missed.
        if let Some(item) = this.shared.items.lock().pop_front() {
            this.shared.kernel_waker.lock().take();
            return Poll::Ready(Some(item));
        }
        if *this.shared.closed.lock() {
            this.shared.kernel_waker.lock().take();
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}
