//! Condition variable (`SPEC_FULL.md` §4.9 "Condition"), paired with an
//! external [`crate::sync::lock::Lock`] the way the stdlib/`curio`
//! equivalents are: the caller must already hold `lock` when calling
//! `wait`/`wait_for`, and gets it back (even if it raced or was cancelled)
//! before the call returns.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::sync::lock::Lock;
use crate::wait_queue::WaitQueue;

pub struct Condition {
    kernel: Kernel,
    wq: Rc<RefCell<WaitQueue>>,
}

impl Condition {
    pub fn new(kernel: &Kernel) -> Condition {
        Condition {
            kernel: kernel.clone(),
            wq: Rc::new(RefCell::new(WaitQueue::new())),
        }
    }

    /// Release `lock`, suspend until notified, then reacquire `lock` before
    /// returning — unconditionally, even on cancellation, so the caller
    /// never wakes up still believing it holds the lock when it does not.
    pub async fn wait(&self, lock: &Lock) -> Result<(), KernelError> {
        lock.release()?;
        let suspend_result = crate::trap::scheduler_wait(self.wq.clone()).await;
        lock.acquire().await?;
        suspend_result
    }

    /// Loop [`Condition::wait`] until `predicate` holds, re-checking it each
    /// time the lock is reacquired (spurious-wakeup safe by construction:
    /// `notify`/`notify_all` carry no payload, so the predicate is the only
    /// way to tell a real change from a stray wakeup).
    pub async fn wait_for<P>(&self, lock: &Lock, mut predicate: P) -> Result<(), KernelError>
    where
        P: FnMut() -> bool,
    {
        while !predicate() {
            self.wait(lock).await?;
        }
        Ok(())
    }

    pub fn notify(&self) {
        self.kernel.inner().borrow_mut().wake_one(&self.wq);
    }

    pub fn notify_all(&self) {
        self.kernel.inner().borrow_mut().wake_all(&self.wq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::error::UserError;

    #[test]
    fn wait_for_wakes_once_predicate_holds() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let run_kernel = kernel.clone();
        let result = kernel.run(async move {
            let lock = Rc::new(Lock::new(&run_kernel));
            let cond = Rc::new(Condition::new(&run_kernel));
            let ready = Rc::new(std::cell::Cell::new(false));

            let l1 = lock.clone();
            let c1 = cond.clone();
            let r1 = ready.clone();
            let waiter = run_kernel.spawn(
                async move {
                    l1.acquire().await.map_err(|e| UserError::new(std::io::Error::other(e.to_string())))?;
                    c1.wait_for(&l1, || r1.get())
                        .await
                        .map_err(|e| UserError::new(std::io::Error::other(e.to_string())))?;
                    l1.release().map_err(|e| UserError::new(std::io::Error::other(e.to_string())))?;
                    Ok::<_, UserError>(())
                },
                false,
            );

            crate::trap::sleep(0.0).await.ok();
            lock.acquire().await.map_err(|e| UserError::new(std::io::Error::other(e.to_string())))?;
            ready.set(true);
            cond.notify_all();
            lock.release().map_err(|e| UserError::new(std::io::Error::other(e.to_string())))?;

            waiter.join().await.map_err(|e| UserError::new(std::io::Error::other(e.to_string())))?;
            Ok::<_, UserError>(())
        });
        assert!(result.is_ok());
    }
}
