//! Expiry hand-off seam.
//!
//! The tick worker never runs user code on its own account: a fired entry is
//! wrapped into a [`Job`] and handed to the configured [`TaskExecutor`].
//! The executor must accept promptly and must not call back into
//! [`WheelTimer::stop`](crate::WheelTimer::stop) synchronously.

use crate::error::SubmitError;

/// A fired timeout, packaged for execution.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Destination for fired timeouts.
///
/// Implementations decide where user code runs (inline, a thread pool, an
/// async runtime). `submit` must not block the calling thread for long: it
/// executes on the tick worker, and time spent here delays every other
/// timeout in the same tick.
pub trait TaskExecutor: Send + Sync {
    /// Enqueue a job for execution.
    ///
    /// # Errors
    ///
    /// A rejected job is logged by the worker and dropped; the associated
    /// entry still counts as fired.
    fn submit(&self, job: Job) -> Result<(), SubmitError>;
}

/// Default executor: runs each job inline on the tick worker thread.
///
/// Suitable only for short, non-blocking tasks. A task that sleeps or
/// performs I/O here stalls the whole wheel.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateExecutor;

impl TaskExecutor for ImmediateExecutor {
    #[inline]
    fn submit(&self, job: Job) -> Result<(), SubmitError> {
        job();
        Ok(())
    }
}
