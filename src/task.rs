//! User-facing task interface.

use crate::entry::Timeout;

/// Work to run when a timeout fires.
///
/// `run` is invoked on the timer's executor with the same [`Timeout`] handle
/// that was returned to the registrant. A panic from either hook is caught
/// and logged by the tick worker; it never kills the worker.
///
/// Closures `Fn(&Timeout)` implement this trait directly. A task that needs
/// to hand itself back to [`WheelTimer::schedule`](crate::WheelTimer::schedule)
/// from inside `run` (periodic work) can keep its state behind an `Arc` and
/// implement the trait on a cheap `Clone` wrapper.
pub trait TimerTask: Send + Sync + 'static {
    /// Called when the entry expires.
    fn run(&self, timeout: &Timeout);

    /// Called by the worker after a cancelled entry has been released,
    /// so the task can free resources reserved at registration.
    fn cancelled(&self, timeout: &Timeout) {
        let _ = timeout;
    }
}

impl<F> TimerTask for F
where
    F: Fn(&Timeout) + Send + Sync + 'static,
{
    fn run(&self, timeout: &Timeout) {
        self(timeout)
    }
}
