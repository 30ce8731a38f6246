//! Hashed wheel timer: approximate, high-throughput one-shot timeouts.
//!
//! Built for workloads that register thousands of timeouts per second
//! (connection idle timers, retry backoffs, keepalives) where near-constant
//! cost per operation matters more than exact firing times:
//! - schedule and cancel are lock-free for producers and amortized O(1);
//! - per-tick cost is independent of the number of scheduled entries;
//! - an entry fires no earlier than its delay and no later than roughly one
//!   tick past it, plus scheduling jitter.
//!
//! # How it works
//! A power-of-two array of buckets is advanced one slot per tick by a single
//! worker thread. An entry with deadline `d` goes to slot
//! `(d / tick) & (len - 1)` carrying the number of full wheel revolutions to
//! wait. Producers hand new entries to an intake queue and cancellations to
//! a cancellation queue; the worker is the only thread that ever touches
//! bucket links, so the hot structures need no locks at all.
//!
//! Flow per tick:
//! 1) sleep to the tick boundary, 2) unlink cancelled entries,
//! 3) place a bounded batch of new entries, 4) sweep the current bucket,
//! handing due entries to the configured executor, 5) advance.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use tickwheel::{Timeout, WheelTimer};
//!
//! let timer = WheelTimer::builder()
//!     .tick_duration(Duration::from_millis(20))
//!     .build()
//!     .unwrap();
//!
//! let timeout = timer
//!     .schedule(
//!         |_t: &Timeout| println!("ding"),
//!         Duration::from_millis(60),
//!     )
//!     .unwrap();
//!
//! assert!(!timeout.is_expired());
//! timer.stop();
//! ```
//!
//! # Module map
//! - `clock`: monotonic millisecond sources.
//! - `error`: construction, registration, and hand-off errors.
//! - `task`: the [`TimerTask`] callback interface.
//! - `executor`: the [`TaskExecutor`] hand-off seam.
//! - internal: `entry` (lifecycle + link state), `bucket` (intrusive expiry
//!   lists), `wheel` (tick worker), `timer` (public surface).

pub mod clock;
pub mod error;
pub mod executor;
pub mod task;

mod bucket;
mod entry;
mod timer;
mod wheel;

#[cfg(test)]
pub mod test_utils;

pub use clock::{Clock, MonotonicClock};
pub use entry::Timeout;
pub use error::{BuildError, ScheduleError, SubmitError, MAX_WHEEL_SIZE};
pub use executor::{ImmediateExecutor, Job, TaskExecutor};
pub use task::TimerTask;
pub use timer::{Builder, WheelTimer};
