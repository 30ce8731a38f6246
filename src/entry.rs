//! Timeout entries and the public [`Timeout`] handle.
//!
//! Each scheduled task is backed by one [`TimeoutInner`], shared between the
//! registrant (through `Timeout`) and the wheel (through the intake queue and
//! bucket links). The record splits into two halves:
//!
//! - an atomic lifecycle word, touched from any thread: `INIT` transitions
//!   once to either `CANCELLED` (registrant wins the CAS) or `EXPIRED`
//!   (worker wins); terminal states are absorbing;
//! - worker-only link state ([`WorkerState`]): remaining rounds, intrusive
//!   neighbors, owning bucket slot, and the exactly-once release latch.
//!
//! # Ordering
//! State transitions use `AcqRel` CAS / `Acquire` loads. The entry itself is
//! published to the worker via the intake queue, so the state word only has
//! to order the cancel/expire race, not the payload.
//!
//! # Safety
//! `WorkerState` is reached through an `UnsafeCell` and must only be touched
//! by the tick worker (or by whoever owns the wheel exclusively, as the
//! synchronous tests do). Producers are limited to the atomic word, the
//! pending counter, and the queues.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU8, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU8, Ordering};

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::task::TimerTask;
use crate::wheel::Core;

pub(crate) const ST_INIT: u8 = 0;
pub(crate) const ST_CANCELLED: u8 = 1;
pub(crate) const ST_EXPIRED: u8 = 2;

/// Sentinel slot index for "not linked into any bucket".
pub(crate) const NO_BUCKET: u32 = u32::MAX;

/// Link state owned by the tick worker.
///
/// `prev`/`next` are non-owning neighbor pointers; the owning reference of a
/// linked entry is held by its bucket (see `bucket.rs`). `released` latches
/// the pending-counter decrement so that the expiry sweep, the cancellation
/// drain, and the stop drain cannot double-account an entry however their
/// visits interleave across ticks.
pub(crate) struct WorkerState {
    pub(crate) remaining_rounds: u64,
    pub(crate) prev: *const TimeoutInner,
    pub(crate) next: *const TimeoutInner,
    pub(crate) bucket: u32,
    pub(crate) released: bool,
}

impl WorkerState {
    #[inline]
    pub(crate) fn is_linked(&self) -> bool {
        self.bucket != NO_BUCKET
    }
}

/// One scheduled timeout.
pub(crate) struct TimeoutInner {
    /// Absolute deadline in milliseconds since the timer started.
    /// `u64::MAX` means "clamped, effectively never fires".
    pub(crate) deadline_ms: u64,
    state: AtomicU8,
    pub(crate) task: Box<dyn TimerTask>,
    /// Non-owning backlink used by `cancel` to reach the cancellation queue.
    pub(crate) core: Weak<Core>,
    ws: UnsafeCell<WorkerState>,
}

// SAFETY: `state` is atomic; `task` is Send + Sync by trait bound; `core` is
// a Weak to a Sync type. The only non-Sync field is `ws`, and the wheel's
// single-writer discipline guarantees it is mutated by at most one thread
// (the tick worker) with no concurrent readers.
unsafe impl Send for TimeoutInner {}
unsafe impl Sync for TimeoutInner {}

impl TimeoutInner {
    pub(crate) fn new(deadline_ms: u64, task: Box<dyn TimerTask>, core: Weak<Core>) -> Arc<Self> {
        Arc::new(Self {
            deadline_ms,
            state: AtomicU8::new(ST_INIT),
            task,
            core,
            ws: UnsafeCell::new(WorkerState {
                remaining_rounds: 0,
                prev: std::ptr::null(),
                next: std::ptr::null(),
                bucket: NO_BUCKET,
                released: false,
            }),
        })
    }

    /// Worker-only access to the link state.
    ///
    /// # Safety
    /// Caller must be the single thread driving the wheel. No other
    /// reference to the `WorkerState` may exist while the returned one does.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn worker_state(&self) -> &mut WorkerState {
        &mut *self.ws.get()
    }

    #[inline]
    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.state() == ST_CANCELLED
    }

    #[inline]
    pub(crate) fn is_expired(&self) -> bool {
        self.state() == ST_EXPIRED
    }

    /// CAS `INIT -> CANCELLED`. False if the entry already fired or was
    /// already cancelled.
    #[inline]
    pub(crate) fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(ST_INIT, ST_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// CAS `INIT -> EXPIRED`. False if a racing `cancel` won.
    #[inline]
    pub(crate) fn try_expire(&self) -> bool {
        self.state
            .compare_exchange(ST_INIT, ST_EXPIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Handle to a scheduled timeout.
///
/// Returned by [`WheelTimer::schedule`](crate::WheelTimer::schedule), passed
/// back into [`TimerTask::run`], and listed by
/// [`WheelTimer::stop`](crate::WheelTimer::stop) for entries that never got
/// to fire. Cloning is cheap; all clones observe the same entry.
#[derive(Clone)]
pub struct Timeout {
    inner: Arc<TimeoutInner>,
}

impl Timeout {
    #[inline]
    pub(crate) fn from_inner(inner: Arc<TimeoutInner>) -> Self {
        Self { inner }
    }

    #[inline]
    pub(crate) fn inner(&self) -> &Arc<TimeoutInner> {
        &self.inner
    }

    /// Worker-side: invoke the user callback with this handle.
    #[inline]
    pub(crate) fn fire(&self) {
        self.inner.task.run(self);
    }

    /// Worker-side: invoke the cancellation hook with this handle.
    #[inline]
    pub(crate) fn notify_cancelled(&self) {
        self.inner.task.cancelled(self);
    }

    /// Request cancellation.
    ///
    /// Returns `true` exactly once: the task will never run. Returns `false`
    /// when the entry already fired or was already cancelled (including by
    /// `stop`). Unlinking from the wheel happens on the worker's next
    /// cancellation drain, bounded by one tick; the pending counter is
    /// decremented there, not here.
    pub fn cancel(&self) -> bool {
        if !self.inner.try_cancel() {
            return false;
        }
        // A dead core means the timer is gone and every entry was already
        // drained; the state flip above is all that is left to do.
        if let Some(core) = self.inner.core.upgrade() {
            core.cancelled.push(Arc::clone(&self.inner));
        }
        true
    }

    /// True once the task has been handed to the executor.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.inner.is_expired()
    }

    /// True once a `cancel` (or `stop`) has claimed the entry.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Milliseconds until the deadline; negative when overdue.
    ///
    /// Diagnostic only: the entry fires on the tick sweep after the deadline
    /// passes, not at this exact instant. Returns 0 when the owning timer no
    /// longer exists.
    pub fn remaining_ms(&self) -> i64 {
        let Some(core) = self.inner.core.upgrade() else {
            return 0;
        };
        let remaining = self.inner.deadline_ms as i128 - core.elapsed_ms() as i128;
        remaining.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state() {
            ST_CANCELLED => "cancelled",
            ST_EXPIRED => "expired",
            _ => "pending",
        };
        f.debug_struct("Timeout")
            .field("deadline_ms", &self.inner.deadline_ms)
            .field("state", &state)
            .finish()
    }
}


// ---------------------------------------------------------------------------
// Loom concurrency tests
// ---------------------------------------------------------------------------

#[cfg(loom)]
mod loom_tests {
    use super::*;
    use loom::thread;

    struct Noop;
    impl TimerTask for Noop {
        fn run(&self, _timeout: &Timeout) {}
    }

    /// Cancel and expire race on the same entry; exactly one must win.
    #[test]
    fn cancel_expire_single_winner() {
        loom::model(|| {
            let e = TimeoutInner::new(1, Box::new(Noop), Weak::new());
            let e2 = Arc::clone(&e);

            let h = thread::spawn(move || e2.try_expire());

            let cancelled = e.try_cancel();
            let expired = h.join().unwrap();

            assert!(
                cancelled ^ expired,
                "exactly one transition must win: cancel={cancelled}, expire={expired}"
            );
            assert!(e.is_cancelled() ^ e.is_expired());
        });
    }

    /// Two concurrent cancels; only one observes the transition.
    #[test]
    fn double_cancel_single_winner() {
        loom::model(|| {
            let e = TimeoutInner::new(1, Box::new(Noop), Weak::new());
            let e2 = Arc::clone(&e);

            let h = thread::spawn(move || e2.try_cancel());

            let a = e.try_cancel();
            let b = h.join().unwrap();

            assert!(a ^ b);
            assert!(e.is_cancelled());
        });
    }
}
