//! Bounded/unbounded queues (`SPEC_FULL.md` §4.9 "Queue / LifoQueue /
//! PriorityQueue"), sharing one `QueueCore` over a pluggable [`Storage`]
//! discipline — the three flavors differ only in pop order, everything
//! else (blocking `put`/`get`, `task_done`/`join`) is common.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;

use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::wait_queue::WaitQueue;

/// A pop order over queued items. `Queue` uses [`FifoStorage`], `LifoQueue`
/// uses [`LifoStorage`], `PriorityQueue` uses [`PriorityStorage`].
pub trait Storage<T> {
    fn push(&mut self, item: T);
    fn pop(&mut self) -> Option<T>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct FifoStorage<T>(VecDeque<T>);

impl<T> Storage<T> for FifoStorage<T> {
    fn push(&mut self, item: T) {
        self.0.push_back(item);
    }
    fn pop(&mut self) -> Option<T> {
        self.0.pop_front()
    }
    fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Default)]
pub struct LifoStorage<T>(Vec<T>);

impl<T> Storage<T> for LifoStorage<T> {
    fn push(&mut self, item: T) {
        self.0.push(item);
    }
    fn pop(&mut self) -> Option<T> {
        self.0.pop()
    }
    fn len(&self) -> usize {
        self.0.len()
    }
}

/// Smallest item first, matching `heapq`-backed `PriorityQueue` semantics.
pub struct PriorityStorage<T: Ord>(BinaryHeap<Reverse<T>>);

impl<T: Ord> Default for PriorityStorage<T> {
    fn default() -> Self {
        PriorityStorage(BinaryHeap::new())
    }
}

impl<T: Ord> Storage<T> for PriorityStorage<T> {
    fn push(&mut self, item: T) {
        self.0.push(Reverse(item));
    }
    fn pop(&mut self) -> Option<T> {
        self.0.pop().map(|Reverse(item)| item)
    }
    fn len(&self) -> usize {
        self.0.len()
    }
}

struct QueueCore<T, S: Storage<T>> {
    storage: RefCell<S>,
    maxsize: usize,
    unfinished: Cell<usize>,
    getters: Rc<RefCell<WaitQueue>>,
    putters: Rc<RefCell<WaitQueue>>,
    joiners: Rc<RefCell<WaitQueue>>,
    _marker: std::marker::PhantomData<T>,
}

/// A blocking queue over a [`Storage`] discipline. `maxsize == 0` means
/// unbounded (`put` never blocks on space).
pub struct Queue<T, S: Storage<T> = FifoStorage<T>> {
    kernel: Kernel,
    core: QueueCore<T, S>,
}

impl<T, S: Storage<T> + Default> Queue<T, S> {
    pub fn new(kernel: &Kernel, maxsize: usize) -> Queue<T, S> {
        Queue {
            kernel: kernel.clone(),
            core: QueueCore {
                storage: RefCell::new(S::default()),
                maxsize,
                unfinished: Cell::new(0),
                getters: Rc::new(RefCell::new(WaitQueue::new())),
                putters: Rc::new(RefCell::new(WaitQueue::new())),
                joiners: Rc::new(RefCell::new(WaitQueue::new())),
                _marker: std::marker::PhantomData,
            },
        }
    }
}

impl<T, S: Storage<T>> Queue<T, S> {
    pub fn len(&self) -> usize {
        self.core.storage.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.storage.borrow().is_empty()
    }

    fn has_room(&self) -> bool {
        self.core.maxsize == 0 || self.len() < self.core.maxsize
    }

    pub async fn put(&self, item: T) -> Result<(), KernelError> {
        loop {
            if self.has_room() {
                self.core.storage.borrow_mut().push(item);
                self.core.unfinished.set(self.core.unfinished.get() + 1);
                self.kernel.inner().borrow_mut().wake_one(&self.core.getters);
                return Ok(());
            }
            if let Err(e) = crate::trap::scheduler_wait(self.core.putters.clone()).await {
                if self.has_room() {
                    self.kernel.inner().borrow_mut().wake_one(&self.core.putters);
                }
                return Err(e);
            }
        }
    }

    pub async fn get(&self) -> Result<T, KernelError> {
        loop {
            if let Some(item) = self.core.storage.borrow_mut().pop() {
                self.kernel.inner().borrow_mut().wake_one(&self.core.putters);
                return Ok(item);
            }
            if let Err(e) = crate::trap::scheduler_wait(self.core.getters.clone()).await {
                if !self.is_empty() {
                    self.kernel.inner().borrow_mut().wake_one(&self.core.getters);
                }
                return Err(e);
            }
        }
    }

    /// Mark one item (previously returned by `get`) as processed. Once every
    /// item ever `put` has a matching `task_done`, `join` unblocks.
    pub fn task_done(&self) {
        let remaining = self.core.unfinished.get().saturating_sub(1);
        self.core.unfinished.set(remaining);
        if remaining == 0 {
            self.kernel.inner().borrow_mut().wake_all(&self.core.joiners);
        }
    }

    /// Suspend until `task_done` has been called once for every item put so
    /// far.
    pub async fn join(&self) -> Result<(), KernelError> {
        while self.core.unfinished.get() > 0 {
            crate::trap::scheduler_wait(self.core.joiners.clone()).await?;
        }
        Ok(())
    }
}

pub type FifoQueue<T> = Queue<T, FifoStorage<T>>;
pub type LifoQueue<T> = Queue<T, LifoStorage<T>>;
pub type PriorityQueue<T> = Queue<T, PriorityStorage<T>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::error::UserError;

    #[test]
    fn fifo_order_preserved() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let run_kernel = kernel.clone();
        let result = kernel.run(async move {
            let q: FifoQueue<i32> = Queue::new(&run_kernel, 0);
            q.put(1).await.unwrap();
            q.put(2).await.unwrap();
            q.put(3).await.unwrap();
            let mut out = Vec::new();
            out.push(q.get().await.unwrap());
            out.push(q.get().await.unwrap());
            out.push(q.get().await.unwrap());
            Ok::<_, UserError>(out)
        });
        assert_eq!(result.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn lifo_order_reversed() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let run_kernel = kernel.clone();
        let result = kernel.run(async move {
            let q: LifoQueue<i32> = Queue::new(&run_kernel, 0);
            q.put(1).await.unwrap();
            q.put(2).await.unwrap();
            q.put(3).await.unwrap();
            let mut out = Vec::new();
            out.push(q.get().await.unwrap());
            out.push(q.get().await.unwrap());
            out.push(q.get().await.unwrap());
            Ok::<_, UserError>(out)
        });
        assert_eq!(result.unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn priority_order_smallest_first() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let run_kernel = kernel.clone();
        let result = kernel.run(async move {
            let q: PriorityQueue<i32> = Queue::new(&run_kernel, 0);
            q.put(5).await.unwrap();
            q.put(1).await.unwrap();
            q.put(3).await.unwrap();
            let mut out = Vec::new();
            out.push(q.get().await.unwrap());
            out.push(q.get().await.unwrap());
            out.push(q.get().await.unwrap());
            Ok::<_, UserError>(out)
        });
        assert_eq!(result.unwrap(), vec![1, 3, 5]);
    }

    #[test]
    fn bounded_put_blocks_until_room() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let run_kernel = kernel.clone();
        let result = kernel.run(async move {
            let q: Rc<FifoQueue<i32>> = Rc::new(Queue::new(&run_kernel, 1));
            q.put(1).await.unwrap();

            let q2 = q.clone();
            let order = Rc::new(RefCell::new(Vec::new()));
            let o1 = order.clone();
            let putter = run_kernel.spawn(
                async move {
                    q2.put(2).await.map_err(|e| UserError::new(std::io::Error::other(e.to_string())))?;
                    o1.borrow_mut().push("put-2");
                    Ok::<_, UserError>(())
                },
                false,
            );

            crate::trap::sleep(0.0).await.ok();
            order.borrow_mut().push("before-get");
            let first = q.get().await.unwrap();
            putter.join().await.map_err(|e| UserError::new(std::io::Error::other(e.to_string())))?;
            let second = q.get().await.unwrap();
            assert_eq!(first, 1);
            assert_eq!(second, 2);
            Ok::<_, UserError>(order.borrow().clone())
        });
        assert_eq!(result.unwrap(), vec!["before-get", "put-2"]);
    }

    #[test]
    fn join_unblocks_once_every_item_is_marked_done() {
        let kernel = Kernel::new(KernelConfig::default()).unwrap();
        let run_kernel = kernel.clone();
        let result = kernel.run(async move {
            let q: Rc<FifoQueue<i32>> = Rc::new(Queue::new(&run_kernel, 0));
            q.put(1).await.unwrap();
            q.put(2).await.unwrap();

            let q2 = q.clone();
            let joiner = run_kernel.spawn(
                async move {
                    q2.join().await.map_err(|e| UserError::new(std::io::Error::other(e.to_string())))?;
                    Ok::<_, UserError>(())
                },
                false,
            );

            crate::trap::sleep(0.0).await.ok();
            assert!(!joiner.is_terminated());
            let _ = q.get().await.unwrap();
            q.task_done();
            let _ = q.get().await.unwrap();
            q.task_done();
            joiner.join().await.map_err(|e| UserError::new(std::io::Error::other(e.to_string())))?;
            Ok::<_, UserError>(())
        });
        assert!(result.is_ok());
    }
}
