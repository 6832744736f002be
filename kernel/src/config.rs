//! Kernel configuration and the scheduler-activation observer contract.
//!
//! An ordinary builder-friendly struct rather than a global static: multiple
//! kernels may coexist in one process on distinct threads, so a mutable
//! global would be actively wrong.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::CancellationError;
use crate::task::TaskId;

/// Observer callbacks invoked synchronously at task-lifecycle transitions.
/// Implementations must not perform blocking I/O — they run inline on the
/// kernel's single thread between traps.
pub trait SchedulerActivation {
    fn activate(&self) {}
    fn created(&self, _task: TaskId) {}
    fn running(&self, _task: TaskId) {}
    fn suspended(&self, _task: TaskId) {}
    fn terminated(&self, _task: TaskId) {}
}

/// A no-op activation, used when `KernelConfig::activation` is `None` is
/// inconvenient to check at every call site.
struct NullActivation;
impl SchedulerActivation for NullActivation {}

pub(crate) fn invoke_activation<F>(activation: &Arc<dyn SchedulerActivation>, f: F)
where
    F: FnOnce(&dyn SchedulerActivation),
{
    // Exceptions from activations are logged and discarded rather than
    // propagated into unrelated tasks.
    let result = panic::catch_unwind(AssertUnwindSafe(|| f(activation.as_ref())));
    if let Err(payload) = result {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(panic = %msg, "scheduler activation panicked; discarding");
    }
}

/// Produces the exception a plain `cancel_task` delivers by default.
pub type CancelExceptionFactory = fn() -> CancellationError;

fn default_cancel_exception() -> CancellationError {
    CancellationError::TaskCancelled
}

/// Kernel-wide tunables, constructed via [`KernelConfig::default`] or the
/// builder methods. Never stored as a global; owned by one [`crate::kernel::Kernel`].
#[derive(Clone)]
pub struct KernelConfig {
    /// When set, every trap dispatch is logged at `trace` level with its
    /// name and arguments.
    pub trace_syscalls: bool,
    /// Overridable so embedding code can attach extra context to the
    /// default cancellation exception.
    pub cancel_exception_factory: CancelExceptionFactory,
    /// Observer invoked at task-lifecycle transitions, if any.
    pub activation: Option<Arc<dyn SchedulerActivation>>,
    /// Whether a panic unwinding out of a task's top-level future should be
    /// caught and turned into a `TaskError` rather than aborting the process.
    pub catch_task_panics: bool,
}

impl KernelConfig {
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }

    pub(crate) fn activation_or_null(&self) -> Arc<dyn SchedulerActivation> {
        self.activation
            .clone()
            .unwrap_or_else(|| Arc::new(NullActivation))
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            trace_syscalls: false,
            cancel_exception_factory: default_cancel_exception,
            activation: None,
            catch_task_panics: true,
        }
    }
}

#[derive(Default)]
pub struct KernelConfigBuilder {
    inner: KernelConfigFields,
}

#[derive(Default)]
struct KernelConfigFields {
    trace_syscalls: Option<bool>,
    cancel_exception_factory: Option<CancelExceptionFactory>,
    activation: Option<Arc<dyn SchedulerActivation>>,
    catch_task_panics: Option<bool>,
}

impl KernelConfigBuilder {
    pub fn trace_syscalls(mut self, enabled: bool) -> Self {
        self.inner.trace_syscalls = Some(enabled);
        self
    }

    pub fn cancel_exception_factory(mut self, factory: CancelExceptionFactory) -> Self {
        self.inner.cancel_exception_factory = Some(factory);
        self
    }

    pub fn activation(mut self, activation: Arc<dyn SchedulerActivation>) -> Self {
        self.inner.activation = Some(activation);
        self
    }

    pub fn catch_task_panics(mut self, enabled: bool) -> Self {
        self.inner.catch_task_panics = Some(enabled);
        self
    }

    pub fn build(self) -> KernelConfig {
        let defaults = KernelConfig::default();
        KernelConfig {
            trace_syscalls: self.inner.trace_syscalls.unwrap_or(defaults.trace_syscalls),
            cancel_exception_factory: self
                .inner
                .cancel_exception_factory
                .unwrap_or(defaults.cancel_exception_factory),
            activation: self.inner.activation.or(defaults.activation),
            catch_task_panics: self
                .inner
                .catch_task_panics
                .unwrap_or(defaults.catch_task_panics),
        }
    }
}
