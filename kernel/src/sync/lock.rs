//! Mutual exclusion (`SPEC_FULL.md` §4.9 "Lock / RLock"), built on
//! [`WaitQueue`] the same way `Event` and `Semaphore` are.
//!
//! Cancellation policy: a release wakes exactly one waiter and leaves the
//! lock itself untouched (`owner` stays `None`) until that waiter's own
//! `acquire` actually claims it. If the woken waiter is cancelled before it
//! gets to run, it notices the lock is still free on its way out and
//! re-wakes the next waiter in its place — the same "renotify on bail"
//! pattern the module-level docs describe for `Semaphore`, so no wakeup the
//! queue handed out is ever silently dropped.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::task::TaskId;
use crate::wait_queue::WaitQueue;

pub struct Lock {
    kernel: Kernel,
    wq: Rc<RefCell<WaitQueue>>,
    owner: Cell<Option<TaskId>>,
}

impl Lock {
    pub fn new(kernel: &Kernel) -> Lock {
        Lock {
            kernel: kernel.clone(),
            wq: Rc::new(RefCell::new(WaitQueue::new())),
            owner: Cell::new(None),
        }
    }

    pub fn locked(&self) -> bool {
        self.owner.get().is_some()
    }

    fn current_task(&self) -> TaskId {
        self.kernel.inner().borrow().current()
    }

    pub async fn acquire(&self) -> Result<(), KernelError> {
        loop {
            if self.owner.get().is_none() {
                self.owner.set(Some(self.current_task()));
                return Ok(());
            }
            if let Err(e) = crate::trap::scheduler_wait(self.wq.clone()).await {
                if self.owner.get().is_none() {
                    self.kernel.inner().borrow_mut().wake_one(&self.wq);
                }
                return Err(e);
            }
        }
    }

    /// Fails with [`KernelError::SyncIOError`] if the caller is not the
    /// current holder.
    pub fn release(&self) -> Result<(), KernelError> {
        let me = self.current_task();
        if self.owner.get() != Some(me) {
            return Err(KernelError::SyncIOError(
                "lock released by a task that does not hold it".to_string(),
            ));
        }
        self.owner.set(None);
        self.kernel.inner().borrow_mut().wake_one(&self.wq);
        Ok(())
    }
}

/// Recursive mutex: the same task may `acquire` it repeatedly without
/// deadlocking itself; `release` must be called once per `acquire` before
/// another task can take it.
pub struct RLock {
    kernel: Kernel,
    wq: Rc<RefCell<WaitQueue>>,
    owner: Cell<Option<TaskId>>,
    depth: Cell<u32>,
}

impl RLock {
    pub fn new(kernel: &Kernel) -> RLock {
        RLock {
            kernel: kernel.clone(),
            wq: Rc::new(RefCell::new(WaitQueue::new())),
            owner: Cell::new(None),
            depth: Cell::new(0),
        }
    }

    pub fn locked(&self) -> bool {
        self.owner.get().is_some()
    }

    fn current_task(&self) -> TaskId {
        self.kernel.inner().borrow().current()
    }

    pub async fn acquire(&self) -> Result<(), KernelError> {
        loop {
            let me = self.current_task();
            match self.owner.get() {
                Some(owner) if owner == me => {
                    self.depth.set(self.depth.get() + 1);
                    return Ok(());
                }
                None => {
                    self.owner.set(Some(me));
                    self.depth.set(1);
                    return Ok(());
                }
                Some(_) => {}
            }
            if let Err(e) = crate::trap::scheduler_wait(self.wq.clone()).await {
                if self.owner.get().is_none() {
                    self.kernel.inner().borrow_mut().wake_one(&self.wq);
                }
                return Err(e);
            }
        }
    }

    pub fn release(&self) -> Result<(), KernelError> {
        let me = self.current_task();
        if self.owner.get() != Some(me) {
            return Err(KernelError::SyncIOError(
                "rlock released by a task that does not hold it".to_string(),
            ));
        }
        let depth = self.depth.get() - 1;
        self.depth.set(depth);
        if depth == 0 {
            self.owner.set(None);
            self.kernel.inner().borrow_mut().wake_one(&self.wq);
        }
        Ok(())
    }
}
