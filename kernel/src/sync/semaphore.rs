//! Counting semaphore (`SPEC_FULL.md` §4.9 "Semaphore"). Same wake-and-
//! recheck, renotify-on-bail discipline as [`crate::sync::lock::Lock`]: a
//! `release` increments the count and wakes one waiter without itself
//! deciding who gets the slot, so a waiter cancelled on its way back up
//! re-wakes the next one if the slot it was handed is still free.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::wait_queue::WaitQueue;

pub struct Semaphore {
    kernel: Kernel,
    wq: Rc<RefCell<WaitQueue>>,
    count: Cell<i64>,
}

impl Semaphore {
    pub fn new(kernel: &Kernel, initial: i64) -> Semaphore {
        Semaphore {
            kernel: kernel.clone(),
            wq: Rc::new(RefCell::new(WaitQueue::new())),
            count: Cell::new(initial),
        }
    }

    pub fn value(&self) -> i64 {
        self.count.get()
    }

    pub async fn acquire(&self) -> Result<(), KernelError> {
        loop {
            if self.count.get() > 0 {
                self.count.set(self.count.get() - 1);
                return Ok(());
            }
            if let Err(e) = crate::trap::scheduler_wait(self.wq.clone()).await {
                if self.count.get() > 0 {
                    self.kernel.inner().borrow_mut().wake_one(&self.wq);
                }
                return Err(e);
            }
        }
    }

    pub fn release(&self) {
        self.count.set(self.count.get() + 1);
        self.kernel.inner().borrow_mut().wake_one(&self.wq);
    }
}
