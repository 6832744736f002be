//! Structured-concurrency supervisor over a set of child tasks. A group's
//! `activity` `WaitQueue` plays exactly the role [`crate::wait_queue::WaitQueue`]
//! already plays for `Lock`/`Event`.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

use crate::error::{KernelError, UserError};
use crate::kernel::{Kernel, TaskHandle};
use crate::task::TaskId;

/// Opaque identifier for one [`TaskGroup`], minted by [`Kernel`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TaskGroupId(u64);

impl TaskGroupId {
    pub(crate) fn from_raw(raw: u64) -> TaskGroupId {
        TaskGroupId(raw)
    }
}

/// Fixed at construction; governs what `join()` waits for and does on
/// failure.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitPolicy {
    /// Wait for every child; a non-cancellation failure cancels the rest.
    All,
    /// Finish as soon as any child terminates (success or failure);
    /// cancel the rest.
    Any,
    /// Finish as soon as a child completes with `Ok` ("first non-null
    /// value" — see the struct-level note on how this maps to Rust);
    /// cancel the rest.
    Object,
    /// Cancel every child immediately, without waiting for any result.
    None,
}

/// A supervisor over a dynamically-grown set of child tasks, all
/// producing the same `T`. Every child belongs to exactly one group; a
/// top-level `Kernel::spawn` creates an ungrouped task instead.
///
/// The spec's `OBJECT` policy is "first non-null value", a dynamically
/// typed check with no uniform Rust equivalent across arbitrary `T`; here
/// it degrades to "first child whose task body returned `Ok`, including
/// `Ok(None)` for `Option`-typed groups" — callers modelling an explicit
/// null should spawn `TaskGroup<Option<U>>` and check `result()` for
/// `Ok(Some(_))` themselves (documented further in `DESIGN.md`).
pub struct TaskGroup<T> {
    id: TaskGroupId,
    kernel: Kernel,
    policy: WaitPolicy,
    children: RefCell<Vec<TaskHandle<T>>>,
    yielded: Cell<usize>,
    winner: Cell<Option<TaskId>>,
    joined: Cell<bool>,
}

impl<T: 'static> TaskGroup<T> {
    pub fn new(kernel: &Kernel, policy: WaitPolicy) -> TaskGroup<T> {
        let id = kernel.inner().borrow_mut().alloc_group_id();
        TaskGroup {
            id,
            kernel: kernel.clone(),
            policy,
            children: RefCell::new(Vec::new()),
            yielded: Cell::new(0),
            winner: Cell::new(None),
            joined: Cell::new(false),
        }
    }

    pub fn id(&self) -> TaskGroupId {
        self.id
    }

    pub fn policy(&self) -> WaitPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.children.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.borrow().is_empty()
    }

    /// `spawn(coro)` — create a child task attached to this group.
    pub fn spawn<F>(&self, fut: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T, UserError>> + 'static,
    {
        let handle = self.kernel.spawn_in(fut, false, Some(self.id));
        self.children.borrow_mut().push(handle.clone());
        handle
    }

    /// `add_task(existing)` — attach an already-spawned ungrouped task.
    pub fn add_task(&self, handle: TaskHandle<T>) {
        self.kernel
            .inner()
            .borrow_mut()
            .attach_to_group(handle.id(), self.id);
        self.children.borrow_mut().push(handle);
    }

    /// Iterate children in completion order, once each. `None` once every
    /// child spawned so far has been yielded.
    pub async fn next_done(&self) -> Option<TaskHandle<T>> {
        loop {
            if self.yielded.get() >= self.children.borrow().len() {
                return None;
            }
            let snapshot = {
                let inner = self.kernel.inner().borrow();
                inner
                    .groups
                    .get(&self.id)
                    .map(|g| (g.completed.clone(), g.activity.clone()))
            };
            let Some((completed, activity)) = snapshot else {
                return None;
            };
            let cursor = self.yielded.get();
            if cursor < completed.len() {
                let task_id = completed[cursor];
                self.yielded.set(cursor + 1);
                return self
                    .children
                    .borrow()
                    .iter()
                    .find(|h| h.id() == task_id)
                    .cloned();
            }
            let _ = crate::trap::scheduler_wait(activity).await;
        }
    }

    /// `next_result()` — same, unwrapping value or raising the child's
    /// exception.
    pub async fn next_result(&self) -> Option<Result<Rc<T>, KernelError>> {
        let handle = self.next_done().await?;
        Some(handle.join().await)
    }

    async fn request_cancel_all_pending(&self) {
        let handles: Vec<TaskHandle<T>> = self.children.borrow().clone();
        for h in &handles {
            if !h.is_terminated() {
                h.cancel(false).await;
            }
        }
    }

    /// `cancel_remaining()` — cancel all non-terminated children and wait
    /// for them to actually terminate.
    pub async fn cancel_remaining(&self) {
        self.request_cancel_all_pending().await;
        while self.next_done().await.is_some() {}
    }

    /// `join()` — wait per policy. Never raises the children's own
    /// exceptions; those surface later via `result()`/`results()`/the
    /// individual handle's own `join()`, matching "the error surfaces
    /// later on result access".
    pub async fn join(&self) -> Result<(), KernelError> {
        if self.joined.replace(true) {
            return Err(KernelError::Reentrant(
                "task group joined twice".to_string(),
            ));
        }
        match self.policy {
            WaitPolicy::None => {
                self.cancel_remaining().await;
            }
            WaitPolicy::Any => {
                if let Some(handle) = self.next_done().await {
                    self.winner.set(Some(handle.id()));
                }
                self.cancel_remaining().await;
            }
            WaitPolicy::Object => {
                while let Some(handle) = self.next_done().await {
                    if matches!(handle.peek_outcome(), Some(Ok(()))) {
                        self.winner.set(Some(handle.id()));
                        break;
                    }
                }
                self.cancel_remaining().await;
            }
            WaitPolicy::All => {
                let mut failed = false;
                while let Some(handle) = self.next_done().await {
                    if !failed
                        && matches!(handle.peek_outcome(), Some(Err(())))
                        && !handle.cancelled()
                    {
                        failed = true;
                        self.request_cancel_all_pending().await;
                    }
                }
            }
        }
        Ok(())
    }

    /// The `ANY`/`OBJECT` policy's single winning result. Only meaningful
    /// after `join()`; `Err(Reentrant)` if no child matched (or `join`
    /// hasn't run).
    pub async fn result(&self) -> Result<Rc<T>, KernelError> {
        let id = self.winner.get().ok_or_else(|| {
            KernelError::Reentrant(
                "task group has no winning result (wrong wait policy, or join() not called)"
                    .to_string(),
            )
        })?;
        let handle = self
            .children
            .borrow()
            .iter()
            .find(|h| h.id() == id)
            .cloned()
            .expect("winner id always names a current child");
        handle.join().await
    }

    /// Every child, ordered by task id (creation order). Call `.join()` on
    /// each to read its value or exception.
    pub fn results(&self) -> Vec<TaskHandle<T>> {
        let mut children = self.children.borrow().clone();
        children.sort_by_key(|h| h.id());
        children
    }
}

impl<T> Drop for TaskGroup<T> {
    fn drop(&mut self) {
        // Best-effort: request cancellation of anything still running.
        // `Drop` cannot `.await`, so this does not wait for termination —
        // callers are expected to `.join()` a group before letting it go,
        // the way a `timeout_after` scope or the kernel's own `close()`
        // drives cancellation to completion elsewhere.
        if let Ok(mut inner) = self.kernel.inner().try_borrow_mut() {
            for h in self.children.borrow().iter() {
                inner.cancel_task(h.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    fn ok(v: u32) -> Result<u32, UserError> {
        Ok(v)
    }

    #[test]
    fn any_policy_picks_first_completion_and_cancels_rest() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let group_kernel = kernel.clone();
        let result = kernel.run(async move {
            let group: TaskGroup<u32> = TaskGroup::new(&group_kernel, WaitPolicy::Any);
            group.spawn(async {
                crate::trap::sleep(0.0).await.ok();
                ok(1)
            });
            group.spawn(async {
                crate::trap::sleep(10.0).await.ok();
                ok(2)
            });
            group.join().await.expect("join");
            let winner = group.result().await.expect("result");
            Ok::<u32, UserError>(*winner)
        });
        assert_eq!(result.unwrap(), 1);
    }

    /// P6 (group closure): once a group's `join()` returns, every child it
    /// ever spawned — winners and the ones cancelled in its wake alike — has
    /// actually terminated, not merely been asked to.
    #[test]
    fn p6_join_leaves_every_child_terminated() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let group_kernel = kernel.clone();
        let result = kernel.run(async move {
            let group: TaskGroup<u32> = TaskGroup::new(&group_kernel, WaitPolicy::Any);
            for i in 0..5u32 {
                group.spawn(async move {
                    crate::trap::sleep(0.01 * (i as f64)).await.ok();
                    ok(i)
                });
            }
            group.join().await.expect("join");
            let all_terminated = group.results().iter().all(|h| h.is_terminated());
            Ok::<bool, UserError>(all_terminated)
        });
        assert!(result.unwrap());
    }
}
