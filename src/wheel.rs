//! The wheel and its tick worker.
//!
//! A fixed power-of-two array of buckets plus a single worker thread that
//! advances one tick per iteration: sleep to the tick boundary, drain the
//! cancellation queue, drain a bounded batch of the intake queue, sweep the
//! current bucket, advance. Every mutation of bucket links and per-entry
//! link state happens here; producers only touch the atomic state word, the
//! pending counter, and the two queues.
//!
//! # Placement
//! For an entry drained from intake at worker tick `t`:
//!
//! ```text
//! calculated_tick  = deadline_ms / tick_ms
//! remaining_rounds = (calculated_tick - t) / wheel_size   (0 when overdue)
//! target_tick      = max(calculated_tick, t)
//! slot             = target_tick & (wheel_size - 1)
//! ```
//!
//! An entry whose nominal tick already passed lands in the current bucket
//! with zero rounds and fires on the next sweep.
//!
//! # Accounting
//! The pending counter is decremented exactly once per entry, on the worker,
//! when the entry leaves the wheel: fire, cancellation release, or stop
//! drain. The per-entry `released` latch makes the decrement idempotent
//! across the several paths that can reach a cancelled entry.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use crossbeam_utils::sync::{Parker, Unparker};

use crate::bucket::{Bucket, MisplacedTimeout};
use crate::clock::Clock;
use crate::entry::{Timeout, TimeoutInner};
use crate::executor::{Job, TaskExecutor};

pub(crate) const WORKER_INIT: u8 = 0;
pub(crate) const WORKER_STARTED: u8 = 1;
pub(crate) const WORKER_SHUTDOWN: u8 = 2;

/// Intake entries moved to buckets per tick. Bounds the damage a producer
/// flood can do to the expiry pass; the remainder is picked up next tick.
pub(crate) const INTAKE_BATCH: usize = 100_000;

/// State shared between the public surface, the producers, and the worker.
pub(crate) struct Core {
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) executor: Arc<dyn TaskExecutor>,
    pub(crate) tick_ms: u64,
    pub(crate) wheel_size: u64,
    /// 0 means unbounded.
    pub(crate) max_pending: u64,
    /// Clock reading at worker start; written once before the lifecycle
    /// state becomes STARTED, read by every deadline computation.
    pub(crate) start_ms: AtomicU64,
    /// Worker lifecycle: INIT -> STARTED -> SHUTDOWN, CAS-serialized.
    pub(crate) state: AtomicU8,
    pub(crate) pending: AtomicU64,
    /// Newly scheduled entries awaiting placement. Many producers, one
    /// consumer (the worker).
    pub(crate) intake: SegQueue<Arc<TimeoutInner>>,
    /// Entries whose state was flipped to CANCELLED, awaiting unlink.
    pub(crate) cancelled: SegQueue<Arc<TimeoutInner>>,
    /// Wakes the worker out of its inter-tick sleep on stop.
    pub(crate) unparker: Mutex<Option<Unparker>>,
    /// Entries still pending when the worker exited, for the stop caller.
    pub(crate) unprocessed: Mutex<Option<Vec<Timeout>>>,
}

impl Core {
    pub(crate) fn new(
        clock: Arc<dyn Clock>,
        executor: Arc<dyn TaskExecutor>,
        tick_ms: u64,
        wheel_size: u64,
        max_pending: u64,
    ) -> Self {
        debug_assert!(wheel_size.is_power_of_two());
        debug_assert!(tick_ms > 0);
        Self {
            clock,
            executor,
            tick_ms,
            wheel_size,
            max_pending,
            start_ms: AtomicU64::new(0),
            state: AtomicU8::new(WORKER_INIT),
            pending: AtomicU64::new(0),
            intake: SegQueue::new(),
            cancelled: SegQueue::new(),
            unparker: Mutex::new(None),
            unprocessed: Mutex::new(None),
        }
    }

    /// Milliseconds since the worker started (0 before start).
    #[inline]
    pub(crate) fn elapsed_ms(&self) -> u64 {
        self.clock
            .now_ms()
            .saturating_sub(self.start_ms.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn slot_mask(&self) -> u64 {
        self.wheel_size - 1
    }
}

/// The tick worker. Owns the buckets; moved onto its thread at start.
pub(crate) struct Worker {
    core: Arc<Core>,
    parker: Parker,
    buckets: Box<[Bucket]>,
    tick: u64,
}

impl Worker {
    pub(crate) fn new(core: Arc<Core>, parker: Parker) -> Self {
        let buckets: Box<[Bucket]> = (0..core.wheel_size).map(|_| Bucket::new()).collect();
        Self {
            core,
            parker,
            buckets,
            tick: 0,
        }
    }

    /// Worker thread main loop.
    pub(crate) fn run(mut self) {
        loop {
            if !self.wait_for_tick() {
                break;
            }
            if let Err(bug) = self.step() {
                log::error!("tick worker stopping on placement violation: {bug}");
                self.core.state.store(WORKER_SHUTDOWN, Ordering::Release);
                break;
            }
        }

        let unprocessed = self.shutdown_drain();
        *self
            .core
            .unprocessed
            .lock()
            .expect("unprocessed mutex poisoned") = Some(unprocessed);
    }

    /// Deadline of the tick about to be processed, in ms since start.
    #[inline]
    fn next_deadline(&self) -> u64 {
        self.core.tick_ms.saturating_mul(self.tick + 1)
    }

    /// Sleep until the next tick boundary. Returns false on shutdown.
    ///
    /// Parks in a loop and recomputes the remaining wait each iteration, so
    /// spurious or early unparks cost nothing but a clock read. Never parks
    /// for less than one millisecond.
    fn wait_for_tick(&mut self) -> bool {
        let target = self.next_deadline();
        loop {
            if self.core.state.load(Ordering::Acquire) == WORKER_SHUTDOWN {
                return false;
            }
            let elapsed = self.core.elapsed_ms();
            if elapsed >= target {
                return true;
            }
            let wait = (target - elapsed).max(1);
            self.parker.park_timeout(Duration::from_millis(wait));
        }
    }

    /// One tick: drain cancellations, place a batch of intake, sweep the
    /// current bucket, advance.
    pub(crate) fn step(&mut self) -> Result<(), MisplacedTimeout> {
        let tick_deadline = self.next_deadline();
        self.drain_cancelled();
        self.drain_intake();

        let slot = (self.tick & self.core.slot_mask()) as usize;
        let core = &self.core;
        self.buckets[slot].expire(
            tick_deadline,
            |arc| fire(core, arc),
            |arc| release(core, &arc, true),
        )?;

        self.tick += 1;
        Ok(())
    }

    /// Unlink everything the producers cancelled since the last tick.
    /// Unbounded: each unlink is O(1) and the queue is bounded by the number
    /// of live entries.
    fn drain_cancelled(&mut self) {
        let core = &self.core;
        let buckets = &mut self.buckets;
        while let Some(entry) = core.cancelled.pop() {
            debug_assert!(entry.is_cancelled());
            // SAFETY: worker thread (single-writer discipline).
            let ws = unsafe { entry.worker_state() };
            if ws.is_linked() {
                let owned = buckets[ws.bucket as usize].unlink(&entry);
                release(core, &owned, true);
            } else {
                // Never placed (still in intake when cancelled), or already
                // released by a sweep; the latch sorts the two out.
                release(core, &entry, true);
            }
        }
    }

    /// Move up to [`INTAKE_BATCH`] newly scheduled entries into buckets.
    fn drain_intake(&mut self) {
        let core = &self.core;
        let buckets = &mut self.buckets;
        let mask = core.slot_mask();
        let tick = self.tick;

        for _ in 0..INTAKE_BATCH {
            let Some(entry) = core.intake.pop() else {
                break;
            };
            if entry.is_cancelled() {
                // Was cancelled before placement; nothing to unlink.
                release(core, &entry, true);
                continue;
            }

            let calculated_tick = entry.deadline_ms / core.tick_ms;
            // SAFETY: worker thread.
            let ws = unsafe { entry.worker_state() };
            ws.remaining_rounds = if calculated_tick > tick {
                (calculated_tick - tick) / core.wheel_size
            } else {
                0
            };
            let target_tick = calculated_tick.max(tick);
            let slot = (target_tick & mask) as u32;
            buckets[slot as usize].push(entry, slot);
        }
    }

    /// Final drain after the loop exits: buckets first, then intake, then
    /// the cancellation queue. Entries still pending are claimed (state
    /// flipped to CANCELLED so a later `cancel` returns false) and handed
    /// back to the stop caller.
    fn shutdown_drain(&mut self) -> Vec<Timeout> {
        let mut unprocessed = Vec::new();
        let core = &self.core;
        let buckets = &mut self.buckets;

        for bucket in buckets.iter_mut() {
            bucket.drain(|arc| {
                if arc.try_cancel() {
                    release(core, &arc, false);
                    unprocessed.push(Timeout::from_inner(arc));
                } else if arc.is_cancelled() {
                    release(core, &arc, true);
                }
                // Expired entries are unlinked at fire time; none are here.
            });
        }

        while let Some(arc) = core.intake.pop() {
            if arc.try_cancel() {
                release(core, &arc, false);
                unprocessed.push(Timeout::from_inner(arc));
            } else if arc.is_cancelled() {
                release(core, &arc, true);
            }
        }

        while let Some(arc) = core.cancelled.pop() {
            // Buckets are empty by now, so nothing can still be linked.
            debug_assert!(!unsafe { arc.worker_state() }.is_linked());
            release(core, &arc, true);
        }

        unprocessed
    }
}

/// Decrement the pending counter exactly once for `entry` and, for the
/// cancellation paths, run the task's `cancelled` hook. Panics from the hook
/// are logged and swallowed.
fn release(core: &Core, entry: &Arc<TimeoutInner>, notify_cancelled: bool) {
    // SAFETY: worker thread.
    let ws = unsafe { entry.worker_state() };
    if ws.released {
        return;
    }
    ws.released = true;
    core.pending.fetch_sub(1, Ordering::Relaxed);

    if notify_cancelled {
        let handle = Timeout::from_inner(Arc::clone(entry));
        if panic::catch_unwind(AssertUnwindSafe(|| handle.notify_cancelled())).is_err() {
            log::error!("timeout cancellation hook panicked; continuing");
        }
    }
}

/// Hand a freshly expired entry to the executor. The entry has already won
/// the expire CAS; it counts as fired even if the executor rejects it.
fn fire(core: &Core, entry: Arc<TimeoutInner>) {
    release(core, &entry, false);

    let handle = Timeout::from_inner(entry);
    let job: Job = Box::new(move || {
        if panic::catch_unwind(AssertUnwindSafe(|| handle.fire())).is_err() {
            log::error!("timer task panicked; worker unaffected");
        }
    });
    if let Err(err) = core.executor.submit(job) {
        log::error!("executor rejected expired timeout: {err}");
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::SubmitError;
    use crate::executor::ImmediateExecutor;
    use crate::task::TimerTask;

    /// Producer-side registration, mirroring `WheelTimer::schedule` without
    /// the thread: bump pending, create, enqueue.
    fn sched(core: &Arc<Core>, delay_ms: u64, task: impl TimerTask) -> Timeout {
        core.pending.fetch_add(1, Ordering::Relaxed);
        let deadline = core.elapsed_ms().saturating_add(delay_ms);
        let inner = TimeoutInner::new(deadline, Box::new(task), Arc::downgrade(core));
        core.intake.push(Arc::clone(&inner));
        Timeout::from_inner(inner)
    }

    fn core_with(tick_ms: u64, wheel_size: u64) -> Arc<Core> {
        Arc::new(Core::new(
            Arc::new(ManualClock::new(0)),
            Arc::new(ImmediateExecutor),
            tick_ms,
            wheel_size,
            0,
        ))
    }

    fn fired_log() -> (Arc<Mutex<Vec<u64>>>, impl Fn(u64) -> RecordingTask) {
        let log: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        (log, move |id| RecordingTask {
            id,
            log: Arc::clone(&log2),
            cancel_calls: Arc::new(AtomicU64::new(0)),
        })
    }

    struct RecordingTask {
        id: u64,
        log: Arc<Mutex<Vec<u64>>>,
        cancel_calls: Arc<AtomicU64>,
    }

    impl TimerTask for RecordingTask {
        fn run(&self, _timeout: &Timeout) {
            self.log.lock().unwrap().push(self.id);
        }
        fn cancelled(&self, _timeout: &Timeout) {
            self.cancel_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn fires_on_first_tick_past_deadline() {
        let core = core_with(100, 8);
        let mut w = Worker::new(Arc::clone(&core), Parker::new());
        let (log, task) = fired_log();

        let handle = sched(&core, 250, task(1));
        assert_eq!(core.pending.load(Ordering::Relaxed), 1);

        w.step().unwrap(); // deadline 100
        w.step().unwrap(); // deadline 200
        assert!(log.lock().unwrap().is_empty());
        assert!(!handle.is_expired());

        w.step().unwrap(); // deadline 300 >= 250
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert!(handle.is_expired());
        assert_eq!(core.pending.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn zero_delay_fires_on_next_sweep() {
        let core = core_with(100, 8);
        let mut w = Worker::new(Arc::clone(&core), Parker::new());
        let (log, task) = fired_log();

        sched(&core, 0, task(7));
        w.step().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![7]);
    }

    #[test]
    fn overdue_entry_lands_in_current_bucket() {
        let core = core_with(100, 8);
        let mut w = Worker::new(Arc::clone(&core), Parker::new());
        let (log, task) = fired_log();

        // Advance the worker to tick 5, then schedule an entry whose nominal
        // tick (deadline 150 -> tick 1) is already in the past. It lands in
        // the current bucket with zero rounds and fires on the next sweep.
        for _ in 0..5 {
            w.step().unwrap();
        }
        sched(&core, 150, task(9));

        w.step().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![9]);
    }

    #[test]
    fn long_delay_waits_full_rounds() {
        let core = core_with(100, 4);
        let mut w = Worker::new(Arc::clone(&core), Parker::new());
        let (log, task) = fired_log();

        // deadline 900 -> calculated tick 9, rounds (9-0)/4 = 2, slot 1.
        sched(&core, 900, task(3));

        for _ in 0..9 {
            w.step().unwrap();
            assert!(log.lock().unwrap().is_empty(), "fired a revolution early");
        }
        w.step().unwrap(); // tick 9, deadline 1000
        assert_eq!(*log.lock().unwrap(), vec![3]);
    }

    #[test]
    fn cancel_before_placement_skips_bucket_entirely() {
        let core = core_with(100, 8);
        let mut w = Worker::new(Arc::clone(&core), Parker::new());
        let (log, task) = fired_log();
        let t = task(1);
        let hook_calls = Arc::clone(&t.cancel_calls);

        let handle = sched(&core, 300, t);
        assert!(handle.cancel());
        assert!(!handle.cancel());

        for _ in 0..6 {
            w.step().unwrap();
        }
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(core.pending.load(Ordering::Relaxed), 0);
        assert_eq!(hook_calls.load(Ordering::Relaxed), 1);
        assert!(w.buckets.iter().all(|b| b.is_empty()));
    }

    #[test]
    fn cancel_after_placement_unlinks_on_next_drain() {
        let core = core_with(100, 8);
        let mut w = Worker::new(Arc::clone(&core), Parker::new());
        let (log, task) = fired_log();

        let handle = sched(&core, 500, task(1));
        w.step().unwrap(); // placed into slot 5
        assert!(handle.cancel());
        w.step().unwrap(); // cancellation drain unlinks it

        assert!(w.buckets.iter().all(|b| b.is_empty()));
        assert_eq!(core.pending.load(Ordering::Relaxed), 0);

        for _ in 0..8 {
            w.step().unwrap();
        }
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn pending_counter_reaches_zero_at_quiescence() {
        let core = core_with(100, 8);
        let mut w = Worker::new(Arc::clone(&core), Parker::new());
        let (log, task) = fired_log();

        let handles: Vec<_> = (0..20).map(|i| sched(&core, 50 * i, task(i))).collect();
        for h in handles.iter().step_by(3) {
            h.cancel();
        }
        for _ in 0..16 {
            w.step().unwrap();
        }

        assert_eq!(core.pending.load(Ordering::Relaxed), 0);
        let fired = log.lock().unwrap();
        for (i, h) in handles.iter().enumerate() {
            let id = i as u64;
            if i % 3 == 0 {
                assert!(h.is_cancelled());
                assert!(!fired.contains(&id));
            } else {
                assert!(h.is_expired());
                assert!(fired.contains(&id));
            }
        }
    }

    #[test]
    fn shutdown_drain_returns_still_pending_entries() {
        let core = core_with(100, 8);
        let mut w = Worker::new(Arc::clone(&core), Parker::new());
        let (log, task) = fired_log();

        let quick = sched(&core, 50, task(0));
        let slow_placed = sched(&core, 10_000, task(1));
        w.step().unwrap(); // fires quick, places slow
        let slow_intake = sched(&core, 10_000, task(2));
        let cancelled = sched(&core, 10_000, task(3));
        cancelled.cancel();

        let unprocessed = w.shutdown_drain();
        let deadlines: Vec<u64> = unprocessed
            .iter()
            .map(|t| t.inner().deadline_ms)
            .collect();
        assert_eq!(unprocessed.len(), 2);
        assert!(deadlines.contains(&slow_placed.inner().deadline_ms));
        assert!(deadlines.contains(&slow_intake.inner().deadline_ms));

        assert!(quick.is_expired());
        assert!(slow_placed.is_cancelled());
        assert!(slow_intake.is_cancelled());
        // Handles returned by the drain refuse a second cancel.
        assert!(!unprocessed[0].cancel());
        assert_eq!(core.pending.load(Ordering::Relaxed), 0);
        assert_eq!(*log.lock().unwrap(), vec![0]);
    }

    struct RejectingExecutor;
    impl TaskExecutor for RejectingExecutor {
        fn submit(&self, _job: Job) -> Result<(), SubmitError> {
            Err(SubmitError::Shutdown)
        }
    }

    #[test]
    fn executor_rejection_counts_as_fired() {
        let core = Arc::new(Core::new(
            Arc::new(ManualClock::new(0)),
            Arc::new(RejectingExecutor),
            100,
            8,
            0,
        ));
        let mut w = Worker::new(Arc::clone(&core), Parker::new());
        let (log, task) = fired_log();

        let handle = sched(&core, 0, task(1));
        w.step().unwrap();

        assert!(handle.is_expired());
        assert!(log.lock().unwrap().is_empty(), "job must not run");
        assert_eq!(core.pending.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn panicking_task_does_not_poison_the_worker() {
        let core = core_with(100, 8);
        let mut w = Worker::new(Arc::clone(&core), Parker::new());
        let (log, task) = fired_log();

        sched(&core, 0, |_t: &Timeout| panic!("task blew up"));
        sched(&core, 100, task(2));

        w.step().unwrap();
        w.step().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![2]);
        assert_eq!(core.pending.load(Ordering::Relaxed), 0);
    }
}

#[cfg(all(test, feature = "wheel-proptest", not(loom)))]
#[path = "wheel_tests.rs"]
mod wheel_tests;
