//! Error types for timer construction, registration, and task hand-off.
//!
//! Errors are stage-specific to keep diagnostics precise. All enums are
//! `#[non_exhaustive]` so variants can be added without breaking callers;
//! consumers should include a fallback match arm.
//!
//! Worker-internal failures (task panics, executor rejections, cancel-hook
//! panics) are logged and swallowed by the tick worker; they never surface
//! through these types.

use std::fmt;

/// Largest accepted wheel size. Power-of-two rounding must not exceed this.
pub const MAX_WHEEL_SIZE: usize = 1 << 30;

/// Errors from [`Builder::build`](crate::Builder::build).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BuildError {
    /// Requested wheel size is zero or rounds up past [`MAX_WHEEL_SIZE`].
    WheelSizeOutOfRange { requested: usize },
    /// Tick duration of zero is meaningless (sub-millisecond values are
    /// clamped up to 1 ms instead).
    TickDurationZero,
    /// `tick_duration * wheel_size` does not fit in 64-bit milliseconds.
    SpanOverflow { tick_ms: u64, wheel_size: u64 },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WheelSizeOutOfRange { requested } => {
                write!(
                    f,
                    "wheel size out of range: {requested} (must be in 1..={MAX_WHEEL_SIZE})"
                )
            }
            Self::TickDurationZero => write!(f, "tick duration must be non-zero"),
            Self::SpanOverflow {
                tick_ms,
                wheel_size,
            } => {
                write!(
                    f,
                    "tick duration {tick_ms} ms times wheel size {wheel_size} overflows u64"
                )
            }
        }
    }
}

impl std::error::Error for BuildError {}

/// Errors from [`WheelTimer::schedule`](crate::WheelTimer::schedule).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScheduleError {
    /// The timer was stopped; no further timeouts are accepted.
    Stopped,
    /// The pending-timeout cap would be exceeded.
    ///
    /// `pending` is the count observed before this registration; the
    /// counter is rolled back, so a slot freed by a fire or a drained
    /// cancellation makes the next attempt succeed.
    CapacityExceeded { pending: u64, limit: u64 },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "timer has been stopped"),
            Self::CapacityExceeded { pending, limit } => {
                write!(f, "pending timeouts would exceed cap: {pending} of {limit}")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Rejection from a [`TaskExecutor`](crate::TaskExecutor) submission.
///
/// The worker logs the rejection and treats the entry as fired; the job
/// is dropped and never re-queued.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SubmitError {
    /// The executor is shutting down and no longer accepts jobs.
    Shutdown,
    /// The executor's own queue is at capacity.
    QueueFull,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "executor is shut down"),
            Self::QueueFull => write!(f, "executor queue is full"),
        }
    }
}

impl std::error::Error for SubmitError {}
