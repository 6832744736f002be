//! A single-threaded cooperative task kernel: a trap-driven scheduler that
//! multiplexes many suspendable task bodies onto one OS thread, using a
//! portable readiness primitive (epoll/kqueue/IOCP via `mio`) to resume tasks
//! when their I/O is ready, a timer wheel for deadlines, and a cancellation
//! engine with nested-timeout semantics and structured concurrency.
//!
//! A task body is an ordinary `async fn` / boxed `dyn Future`; suspension
//! points are `.await`s on one of this crate's own trap futures
//! ([`trap::read_wait`], [`trap::write_wait`], [`trap::sleep`],
//! [`trap::future_wait`], [`trap::scheduler_wait`]). There is no implicit
//! executor: a [`kernel::Kernel`] must be constructed and driven explicitly
//! with [`kernel::Kernel::run`].
//!
//! ```no_run
//! use task_kernel::config::KernelConfig;
//! use task_kernel::kernel::Kernel;
//! use task_kernel::trap;
//!
//! let kernel = Kernel::new(KernelConfig::default()).unwrap();
//! let result = kernel.run(async {
//!     trap::sleep(0.05).await.ok();
//!     Ok::<_, task_kernel::error::UserError>(42)
//! });
//! assert_eq!(result.unwrap(), 42);
//! ```

pub mod cancellation;
pub mod clock;
pub mod config;
pub mod error;
pub mod kernel;
pub mod readiness;
pub mod sync;
pub mod task;
pub mod task_group;
pub mod timeout;
pub mod timer_heap;
pub mod trap;
pub mod wait_queue;

pub use crate::error::{KernelError, KernelResult, UserError};
pub use crate::kernel::{Kernel, TaskHandle};
pub use crate::task::TaskId;
pub use crate::task_group::{TaskGroup, WaitPolicy};
