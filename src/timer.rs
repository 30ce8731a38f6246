//! Public timer surface: configuration, registration, stop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_utils::sync::Parker;

use crate::clock::{Clock, MonotonicClock};
use crate::entry::{Timeout, TimeoutInner};
use crate::error::{BuildError, ScheduleError, MAX_WHEEL_SIZE};
use crate::executor::{ImmediateExecutor, TaskExecutor};
use crate::task::TimerTask;
use crate::wheel::{Core, Worker, WORKER_INIT, WORKER_SHUTDOWN, WORKER_STARTED};

/// Smallest accepted tick duration; shorter configurations are clamped up.
const MIN_TICK_MS: u64 = 1;

/// Live-instance gauge. Each timer owns a worker thread, so dozens of them
/// is almost always a leak of timers that should be shared.
static INSTANCES: AtomicUsize = AtomicUsize::new(0);
static INSTANCE_WARNING: AtomicBool = AtomicBool::new(false);
const INSTANCE_WARN_THRESHOLD: usize = 64;

/// Configuration for a [`WheelTimer`].
///
/// | Knob             | Effect                                         | Default |
/// |------------------|------------------------------------------------|---------|
/// | `tick_duration`  | Tick boundary spacing; sub-ms clamped to 1 ms  | 100 ms  |
/// | `ticks_per_wheel`| Slots; rounded up to a power of two, <= 2^30   | 512     |
/// | `max_pending`    | Cap on simultaneously pending entries; 0 = off | 0       |
/// | `executor`       | Destination for fired tasks                    | inline  |
/// | `clock`          | Monotonic millisecond source                   | Instant |
#[derive(Clone)]
pub struct Builder {
    tick_duration: Duration,
    ticks_per_wheel: usize,
    max_pending: u64,
    executor: Arc<dyn TaskExecutor>,
    clock: Arc<dyn Clock>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(100),
            ticks_per_wheel: 512,
            max_pending: 0,
            executor: Arc::new(ImmediateExecutor),
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Milliseconds between tick boundaries. Finer ticks mean tighter firing
    /// but more worker wakeups.
    pub fn tick_duration(mut self, tick: Duration) -> Self {
        self.tick_duration = tick;
        self
    }

    /// Requested wheel size. Rounded up to the next power of two; a wheel
    /// sized near the common delay divided by the tick duration avoids
    /// multi-revolution waits.
    pub fn ticks_per_wheel(mut self, ticks: usize) -> Self {
        self.ticks_per_wheel = ticks;
        self
    }

    /// Upper bound on simultaneously pending timeouts. Zero disables the cap.
    pub fn max_pending(mut self, max: u64) -> Self {
        self.max_pending = max;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate, normalize, and construct the timer. The worker thread is
    /// not spawned until the first registration.
    pub fn build(self) -> Result<WheelTimer, BuildError> {
        if self.ticks_per_wheel == 0 || self.ticks_per_wheel > MAX_WHEEL_SIZE {
            return Err(BuildError::WheelSizeOutOfRange {
                requested: self.ticks_per_wheel,
            });
        }
        let wheel_size = self.ticks_per_wheel.next_power_of_two() as u64;

        if self.tick_duration.is_zero() {
            return Err(BuildError::TickDurationZero);
        }
        let requested_ms = self.tick_duration.as_millis().min(u64::MAX as u128) as u64;
        let tick_ms = if requested_ms < MIN_TICK_MS {
            log::warn!(
                "tick duration {:?} below the {MIN_TICK_MS} ms minimum; clamping up",
                self.tick_duration
            );
            MIN_TICK_MS
        } else {
            requested_ms
        };

        // One full revolution must be representable, or round arithmetic
        // degenerates.
        if tick_ms > u64::MAX / wheel_size {
            return Err(BuildError::SpanOverflow {
                tick_ms,
                wheel_size,
            });
        }

        let live = INSTANCES.fetch_add(1, Ordering::Relaxed) + 1;
        if live > INSTANCE_WARN_THRESHOLD && !INSTANCE_WARNING.swap(true, Ordering::Relaxed) {
            log::warn!(
                "{live} live WheelTimer instances; timers are meant to be shared, \
                 this is likely a leak"
            );
        }

        Ok(WheelTimer {
            core: Arc::new(Core::new(
                self.clock,
                self.executor,
                tick_ms,
                wheel_size,
                self.max_pending,
            )),
            worker: Mutex::new(WorkerSlot {
                handle: None,
                thread_id: None,
            }),
        })
    }
}

struct WorkerSlot {
    handle: Option<thread::JoinHandle<()>>,
    thread_id: Option<ThreadId>,
}

/// Hashed wheel timer.
///
/// Accepts one-shot timeouts and fires each approximately at its deadline:
/// no earlier than the requested delay, no later than roughly one tick past
/// it (plus scheduling jitter). Registration and cancellation are lock-free
/// on the producer side; a single background worker advances the wheel.
///
/// Entries that round to the same tick fire in an unspecified order.
pub struct WheelTimer {
    core: Arc<Core>,
    worker: Mutex<WorkerSlot>,
}

impl WheelTimer {
    /// A timer with default configuration (100 ms ticks, 512 slots,
    /// unbounded, inline executor).
    pub fn new() -> Self {
        Builder::new().build().expect("default configuration is valid")
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Register `task` to run once, approximately `delay` from now.
    ///
    /// Starts the worker thread on first use. The delay is clamped so the
    /// deadline always fits in 64-bit milliseconds; a saturated deadline
    /// effectively never fires.
    ///
    /// # Errors
    ///
    /// [`ScheduleError::Stopped`] after [`stop`](Self::stop);
    /// [`ScheduleError::CapacityExceeded`] when a `max_pending` cap is
    /// configured and would be crossed (the counter is rolled back).
    pub fn schedule(
        &self,
        task: impl TimerTask,
        delay: Duration,
    ) -> Result<Timeout, ScheduleError> {
        if self.core.state.load(Ordering::Acquire) == WORKER_SHUTDOWN {
            return Err(ScheduleError::Stopped);
        }

        // Increment first, then check: concurrent producers all observe a
        // value covering their own registration, so the cap cannot be
        // overshot by a race.
        let pending = self.core.pending.fetch_add(1, Ordering::Relaxed) + 1;
        if self.core.max_pending > 0 && pending > self.core.max_pending {
            self.core.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(ScheduleError::CapacityExceeded {
                pending: pending - 1,
                limit: self.core.max_pending,
            });
        }

        if let Err(err) = self.start() {
            self.core.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(err);
        }

        let delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
        let deadline_ms = self.core.elapsed_ms().saturating_add(delay_ms);
        let inner = TimeoutInner::new(deadline_ms, Box::new(task), Arc::downgrade(&self.core));
        self.core.intake.push(Arc::clone(&inner));
        Ok(Timeout::from_inner(inner))
    }

    /// Spawn the worker on the first successful registration.
    ///
    /// The slot mutex serializes the INIT -> STARTED transition; `start_ms`
    /// is written before STARTED is published so every deadline computation
    /// sees it.
    fn start(&self) -> Result<(), ScheduleError> {
        match self.core.state.load(Ordering::Acquire) {
            WORKER_STARTED => return Ok(()),
            WORKER_SHUTDOWN => return Err(ScheduleError::Stopped),
            _ => {}
        }

        let mut slot = self.worker.lock().expect("worker slot mutex poisoned");
        match self.core.state.load(Ordering::Acquire) {
            WORKER_STARTED => return Ok(()),
            WORKER_SHUTDOWN => return Err(ScheduleError::Stopped),
            _ => {}
        }

        self.core
            .start_ms
            .store(self.core.clock.now_ms(), Ordering::Release);

        let parker = Parker::new();
        *self.core.unparker.lock().expect("unparker mutex poisoned") =
            Some(parker.unparker().clone());

        let worker = Worker::new(Arc::clone(&self.core), parker);
        let handle = thread::Builder::new()
            .name("tickwheel-worker".into())
            .spawn(move || worker.run())
            .expect("failed to spawn timer worker thread");
        slot.thread_id = Some(handle.thread().id());
        slot.handle = Some(handle);

        let started = self.core.state.compare_exchange(
            WORKER_INIT,
            WORKER_STARTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug_assert!(started.is_ok(), "lifecycle CAS raced under the slot lock");
        Ok(())
    }

    /// Stop the worker and return every timeout that had not yet fired.
    ///
    /// Blocks until the worker has drained the wheel and both queues.
    /// Returned handles are in the cancelled state (a later
    /// [`Timeout::cancel`] returns `false`). Idempotent: a second call, or a
    /// call on a timer that never started, returns an empty vec.
    ///
    /// # Panics
    ///
    /// When called from the timer's own worker thread, i.e. from inside a
    /// firing task on the inline executor, which would deadlock on join.
    pub fn stop(&self) -> Vec<Timeout> {
        let mut slot = self.worker.lock().expect("worker slot mutex poisoned");
        if slot.thread_id == Some(thread::current().id()) {
            panic!("WheelTimer::stop called from the timer worker thread (inside a firing task)");
        }

        if self
            .core
            .state
            .compare_exchange(
                WORKER_INIT,
                WORKER_SHUTDOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            // Never started: nothing queued, nothing to drain.
            return Vec::new();
        }

        self.core.state.store(WORKER_SHUTDOWN, Ordering::Release);
        if let Some(unparker) = self
            .core
            .unparker
            .lock()
            .expect("unparker mutex poisoned")
            .as_ref()
        {
            unparker.unpark();
        }

        let Some(handle) = slot.handle.take() else {
            // A previous stop already joined and took the drain result.
            return Vec::new();
        };
        if handle.join().is_err() {
            log::error!("timer worker thread panicked during shutdown");
        }

        self.core
            .unprocessed
            .lock()
            .expect("unprocessed mutex poisoned")
            .take()
            .unwrap_or_default()
    }

    /// Advisory count of accepted-but-unfired timeouts.
    #[inline]
    pub fn pending_timeouts(&self) -> u64 {
        self.core.pending.load(Ordering::Relaxed)
    }
}

impl Default for WheelTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WheelTimer {
    fn drop(&mut self) {
        INSTANCES.fetch_sub(1, Ordering::Relaxed);
        // Best effort: reclaim the worker thread. Dropping a timer from its
        // own worker thread is already rejected by stop().
        let _ = self.stop();
    }
}

impl std::fmt::Debug for WheelTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WheelTimer")
            .field("tick_ms", &self.core.tick_ms)
            .field("wheel_size", &self.core.wheel_size)
            .field("pending", &self.pending_timeouts())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_zero_wheel() {
        let err = Builder::new().ticks_per_wheel(0).build().unwrap_err();
        assert!(matches!(err, BuildError::WheelSizeOutOfRange { requested: 0 }));
    }

    #[test]
    fn builder_rejects_oversized_wheel() {
        let err = Builder::new()
            .ticks_per_wheel(MAX_WHEEL_SIZE + 1)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::WheelSizeOutOfRange { .. }));
    }

    #[test]
    fn builder_rejects_zero_tick() {
        let err = Builder::new()
            .tick_duration(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::TickDurationZero);
    }

    #[test]
    fn builder_rejects_span_overflow() {
        let err = Builder::new()
            .tick_duration(Duration::from_millis(u64::MAX / 2))
            .ticks_per_wheel(4)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::SpanOverflow { .. }));
    }

    #[test]
    fn builder_clamps_submillisecond_tick() {
        let timer = Builder::new()
            .tick_duration(Duration::from_micros(10))
            .build()
            .unwrap();
        assert_eq!(timer.core.tick_ms, MIN_TICK_MS);
    }

    #[test]
    fn builder_rounds_wheel_to_power_of_two() {
        let timer = Builder::new().ticks_per_wheel(300).build().unwrap();
        assert_eq!(timer.core.wheel_size, 512);
    }

    #[test]
    fn stop_before_start_is_empty_and_final() {
        let timer = WheelTimer::new();
        assert!(timer.stop().is_empty());
        assert!(timer.stop().is_empty());
        let err = timer
            .schedule(|_t: &Timeout| {}, Duration::from_millis(1))
            .unwrap_err();
        assert_eq!(err, ScheduleError::Stopped);
        assert_eq!(timer.pending_timeouts(), 0);
    }
}
