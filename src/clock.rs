//! Monotonic millisecond time sources.
//!
//! The tick worker consumes whole milliseconds from a [`Clock`] and requires
//! the value to be non-decreasing for the life of the process. Wall-clock
//! time is unsuitable: it jumps on NTP adjustments and suspend/resume.
//! Granularity coarser than the tick duration is acceptable; the worker
//! never sleeps for less than one millisecond.

use std::time::Instant;

/// Monotone non-decreasing millisecond counter.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;
}

/// Default clock anchored to an [`Instant`] captured at construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        // Instant::elapsed is monotone; ~584 million years of millis fit in u64.
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for deterministic tests.
#[cfg(test)]
pub(crate) struct ManualClock(std::sync::atomic::AtomicU64);

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new(start_ms: u64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(start_ms))
    }

    pub(crate) fn advance(&self, delta_ms: u64) {
        self.0
            .fetch_add(delta_ms, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn set(&self, now_ms: u64) {
        let prev = self.0.swap(now_ms, std::sync::atomic::Ordering::SeqCst);
        assert!(prev <= now_ms, "manual clock moved backwards");
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
