//! The user-facing hashed wheel timer.
//!
//! `WheelTimer` is cheap to share: any number of threads schedule and cancel
//! through `&self` while one lazily spawned worker turns the wheel. Stopping
//! is cooperative and hands back every timeout that never got to run.

use std::panic;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::timer::timeout::Timeout;
use crate::timer::wheel::Wheel;
use crate::timer::worker::Worker;
use crate::timer::{
    duration_to_ns, Shared, TimerTask, STATE_INIT, STATE_SHUTDOWN, STATE_STARTED,
};
use crate::TimerError;

/// Tick length used by `WheelTimer::default`.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
/// Slot count used by `WheelTimer::default`.
pub const DEFAULT_TICKS_PER_WHEEL: usize = 512;

/// Every timer owns a worker thread, so a pile of live instances is nearly
/// always a leak. One warning is logged the first time the count passes this.
const INSTANCE_WARN_LIMIT: usize = 64;

static INSTANCE_COUNT: AtomicUsize = AtomicUsize::new(0);
static WARNED_TOO_MANY: AtomicBool = AtomicBool::new(false);

/// Where the worker currently lives: not yet spawned, on a thread, or gone.
enum WorkerSlot {
    Idle(Worker),
    Running(JoinHandle<Vec<Arc<Timeout>>>),
    Stopped,
}

/// A hashed timing wheel running one background worker thread.
///
/// Scheduling and cancellation are O(1) and callable from any thread. All
/// deadlines share the coarse precision of the tick, which is the trade
/// that keeps the costs constant regardless of how many timeouts are in
/// flight.
pub struct WheelTimer {
    shared: Arc<Shared>,
    worker: Mutex<WorkerSlot>,
    /// Guards the instance-count decrement so stop() and drop() cannot
    /// both take credit.
    counted: AtomicBool,
}

impl WheelTimer {
    /// Builds a timer with `tick`-long slots and roughly `ticks_per_wheel`
    /// of them (rounded up to a power of two). `max_pending` caps the
    /// outstanding timeouts, zero meaning unlimited. The worker thread is
    /// not spawned until the first schedule.
    pub fn new(
        tick: Duration,
        ticks_per_wheel: usize,
        max_pending: u64,
    ) -> Result<Self, TimerError> {
        Ok(Self::assemble(Wheel::new(tick, ticks_per_wheel)?, max_pending))
    }

    fn assemble(wheel: Wheel, max_pending: u64) -> Self {
        let shared = Arc::new(Shared::new(max_pending));
        let worker = Worker::new(wheel, Arc::clone(&shared));
        let live = INSTANCE_COUNT.fetch_add(1, AcqRel) + 1;
        if live > INSTANCE_WARN_LIMIT && !WARNED_TOO_MANY.swap(true, AcqRel) {
            log::warn!(
                "{live} timers are live, each owning a worker thread; \
                 this is usually a leak, share one instance instead"
            );
        }
        Self {
            shared,
            worker: Mutex::new(WorkerSlot::Idle(worker)),
            counted: AtomicBool::new(true),
        }
    }

    /// Schedules `task` to run once, `delay` from now, on the worker thread.
    ///
    /// The returned handle can be cancelled from any thread until the task
    /// actually fires. Fails once the timer is stopped or when `max_pending`
    /// would be exceeded.
    pub fn schedule<T: TimerTask>(
        &self,
        task: T,
        delay: Duration,
    ) -> Result<Arc<Timeout>, TimerError> {
        // count it first so concurrent schedulers cannot slip past the cap
        let pending = self.shared.pending.fetch_add(1, AcqRel) + 1;
        if self.shared.max_pending > 0 && pending > self.shared.max_pending {
            self.shared.pending.fetch_sub(1, AcqRel);
            return Err(TimerError::TooManyPending {
                pending,
                max: self.shared.max_pending,
            });
        }
        if let Err(err) = self.start() {
            self.shared.pending.fetch_sub(1, AcqRel);
            return Err(err);
        }

        // deadlines are nanoseconds on the worker's own clock
        let start = self.shared.start.wait();
        let deadline = duration_to_ns(start.elapsed()).saturating_add(duration_to_ns(delay));
        let timeout = Timeout::new(
            Box::new(task),
            deadline,
            Arc::downgrade(&self.shared.cancellations),
        );
        self.shared.intake.push(Arc::clone(&timeout));
        Ok(timeout)
    }

    /// Spawns the worker thread if nobody has yet. Safe to call from any
    /// thread at any time; schedule() does it implicitly.
    pub fn start(&self) -> Result<(), TimerError> {
        match self.shared.state() {
            STATE_STARTED => return Ok(()),
            STATE_SHUTDOWN => return Err(TimerError::Shutdown),
            _ => {}
        }

        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        // somebody may have raced us to the lock
        if self
            .shared
            .state
            .compare_exchange(STATE_INIT, STATE_STARTED, AcqRel, Acquire)
            .is_err()
        {
            return match self.shared.state() {
                STATE_STARTED => Ok(()),
                _ => Err(TimerError::Shutdown),
            };
        }

        let WorkerSlot::Idle(worker) = std::mem::replace(&mut *slot, WorkerSlot::Stopped) else {
            // the CAS winner owns an Idle slot; anything else means the
            // worker is already gone, so fail closed
            self.shared.state.store(STATE_SHUTDOWN, Release);
            self.release_instance();
            return Err(TimerError::Shutdown);
        };
        match thread::Builder::new()
            .name("tickwheel-worker".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                *slot = WorkerSlot::Running(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.state.store(STATE_SHUTDOWN, Release);
                self.release_instance();
                Err(TimerError::WorkerSpawn(err.to_string()))
            }
        }
    }

    /// Stops the timer and joins the worker, returning every timeout that
    /// was still waiting. Subsequent calls return an empty vec. Calling this
    /// from inside a timer task fails instead of deadlocking.
    pub fn stop(&self) -> Result<Vec<Arc<Timeout>>, TimerError> {
        if self
            .shared
            .worker_id
            .get()
            .is_some_and(|id| *id == thread::current().id())
        {
            return Err(TimerError::StopFromWorker);
        }

        if self
            .shared
            .state
            .compare_exchange(STATE_STARTED, STATE_SHUTDOWN, AcqRel, Acquire)
            .is_err()
        {
            // never started, or another stop() already won; either way make
            // sure nothing can start later
            self.shared.state.store(STATE_SHUTDOWN, Release);
            self.release_instance();
            return Ok(Vec::new());
        }

        let handle = {
            let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *slot, WorkerSlot::Stopped) {
                WorkerSlot::Running(handle) => Some(handle),
                other => {
                    *slot = other;
                    None
                }
            }
        };

        let unprocessed = match handle {
            Some(handle) => {
                // the worker may be parked mid-tick
                handle.thread().unpark();
                match handle.join() {
                    Ok(unprocessed) => unprocessed,
                    Err(cause) => {
                        self.release_instance();
                        panic::resume_unwind(cause);
                    }
                }
            }
            None => Vec::new(),
        };
        self.release_instance();
        Ok(unprocessed)
    }

    /// True once stop() has begun (or the timer failed to start).
    pub fn is_stopped(&self) -> bool {
        self.shared.state() == STATE_SHUTDOWN
    }

    /// Timeouts scheduled but not yet expired or cancelled.
    pub fn pending_timeouts(&self) -> u64 {
        self.shared.pending.load(Acquire)
    }

    fn release_instance(&self) {
        if self.counted.swap(false, AcqRel) {
            INSTANCE_COUNT.fetch_sub(1, AcqRel);
        }
    }
}

impl Default for WheelTimer {
    /// A timer with the conventional geometry: 100ms ticks, 512 slots, no
    /// pending cap.
    fn default() -> Self {
        Self::assemble(
            Wheel::from_parts(duration_to_ns(DEFAULT_TICK), DEFAULT_TICKS_PER_WHEEL),
            0,
        )
    }
}

impl Drop for WheelTimer {
    /// Flags shutdown and wakes the worker, without joining it. The worker
    /// notices on its next wakeup, sweeps, and exits on its own.
    fn drop(&mut self) {
        self.shared.state.store(STATE_SHUTDOWN, Release);
        let slot = self.worker.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let WorkerSlot::Running(handle) = slot {
            handle.thread().unpark();
        }
        self.release_instance();
    }
}
