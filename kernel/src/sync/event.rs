//! Sticky boolean handshake (`SPEC_FULL.md` §4.9 "Event"): the simplest
//! primitive built directly on [`WaitQueue`], with no counter or ownership
//! concept to restore on cancellation — a cancelled waiter just drops off
//! the queue (`WaitQueue::cancel_wait`, already wired through the
//! `scheduler_wait` trap) and the set/cleared flag is untouched either way.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::wait_queue::WaitQueue;

pub struct Event {
    kernel: Kernel,
    wq: Rc<RefCell<WaitQueue>>,
    set: Cell<bool>,
}

impl Event {
    pub fn new(kernel: &Kernel) -> Event {
        Event {
            kernel: kernel.clone(),
            wq: Rc::new(RefCell::new(WaitQueue::new())),
            set: Cell::new(false),
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.get()
    }

    /// Suspend until [`Event::set`] is called, or return immediately if
    /// already set.
    pub async fn wait(&self) -> Result<(), KernelError> {
        while !self.set.get() {
            crate::trap::scheduler_wait(self.wq.clone()).await?;
        }
        Ok(())
    }

    /// Wake every current waiter and stay set until [`Event::clear`].
    pub fn set(&self) {
        self.set.set(true);
        self.kernel.inner().borrow_mut().wake_all(&self.wq);
    }

    pub fn clear(&self) {
        self.set.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::error::UserError;

    #[test]
    fn waiters_unblock_in_fifo_order_once_set() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let run_kernel = kernel.clone();
        let result = kernel.run(async move {
            let event = Rc::new(Event::new(&run_kernel));
            let order = Rc::new(RefCell::new(Vec::new()));

            let e1 = event.clone();
            let o1 = order.clone();
            let waiter_a = run_kernel.spawn(
                async move {
                    e1.wait().await.map_err(|e| UserError::new(std::io::Error::other(e.to_string())))?;
                    o1.borrow_mut().push("a");
                    Ok::<_, UserError>(())
                },
                false,
            );
            let e2 = event.clone();
            let o2 = order.clone();
            let waiter_b = run_kernel.spawn(
                async move {
                    e2.wait().await.map_err(|e| UserError::new(std::io::Error::other(e.to_string())))?;
                    o2.borrow_mut().push("b");
                    Ok::<_, UserError>(())
                },
                false,
            );

            crate::trap::sleep(0.0).await.ok();
            event.set();
            waiter_a.join().await.ok();
            waiter_b.join().await.ok();
            Ok::<_, UserError>(order.borrow().clone())
        });
        assert_eq!(result.unwrap(), vec!["a", "b"]);
    }
}
