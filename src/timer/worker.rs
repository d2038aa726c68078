//! The worker thread behind a running timer: a drift-corrected tick loop
//! that drains cancellations, transfers freshly scheduled timeouts into
//! their buckets, expires the current slot, and on shutdown sweeps every
//! unprocessed timeout back out to the stop() caller.

use std::sync::atomic::Ordering::AcqRel;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::timer::timeout::Timeout;
use crate::timer::wheel::Wheel;
use crate::timer::{duration_to_ns, Shared, STATE_SHUTDOWN};

/// Upper bound on how many newly scheduled timeouts one tick pulls off the
/// intake queue, so a burst of producers cannot stall expiry indefinitely.
const INTAKE_BATCH: usize = 100_000;

pub struct Worker {
    wheel: Wheel,
    shared: Arc<Shared>,
    tick: u64,
    unprocessed: Vec<Arc<Timeout>>,
}

impl Worker {
    pub fn new(wheel: Wheel, shared: Arc<Shared>) -> Self {
        Self {
            wheel,
            shared,
            tick: 0,
            unprocessed: Vec::new(),
        }
    }

    /// The worker thread body. Returns every timeout that was still waiting
    /// when the timer shut down.
    pub fn run(mut self) -> Vec<Arc<Timeout>> {
        let start = Instant::now();
        // publish the id first so stop() can recognize a call made from
        // inside a task without taking any lock
        let _ = self.shared.worker_id.set(thread::current().id());
        self.shared.start.open(start);

        while self.shared.state() != STATE_SHUTDOWN {
            if let Some(elapsed) = self.wait_for_tick(start) {
                let slot = (self.tick & self.wheel.mask()) as usize;
                self.drain_cancellations();
                self.transfer_intake();
                self.wheel
                    .bucket_mut(slot)
                    .expire(elapsed, &self.shared.pending);
                self.tick += 1;
            }
        }

        // hand everything still in flight back to the stop() caller
        for slot in 0..self.wheel.slot_count() {
            self.wheel
                .bucket_mut(slot)
                .drain_into(&mut self.unprocessed, &self.shared.pending);
        }
        while let Ok(timeout) = self.shared.intake.pop() {
            release_unassigned(&timeout, &self.shared);
            if timeout.is_pending() {
                self.unprocessed.push(timeout);
            }
        }
        self.drain_cancellations();
        self.unprocessed
    }

    /// Parks until the current tick's end target, correcting for however
    /// long earlier ticks overran. Returns the actual elapsed nanoseconds,
    /// or None if shutdown was flagged while parked.
    fn wait_for_tick(&self, start: Instant) -> Option<u64> {
        let target = self.wheel.tick_target(self.tick);
        loop {
            let elapsed = duration_to_ns(start.elapsed());
            if elapsed >= target {
                return Some(elapsed);
            }
            thread::park_timeout(park_granularity(Duration::from_nanos(target - elapsed)));
            if self.shared.state() == STATE_SHUTDOWN {
                return None;
            }
        }
    }

    /// Unlinks every timeout whose cancel() landed since the last tick.
    fn drain_cancellations(&mut self) {
        while let Ok(timeout) = self.shared.cancellations.pop() {
            // link state is worker-only, so the read is unsynchronized
            let slot = unsafe { (*timeout.link_ptr()).bucket };
            match slot {
                Some(slot) => {
                    drop(
                        self.wheel
                            .bucket_mut(slot)
                            .unlink(&timeout, &self.shared.pending),
                    );
                }
                // cancelled before it ever reached a bucket; the copy still
                // parked on the intake queue gets skipped when it surfaces
                None => release_unassigned(&timeout, &self.shared),
            }
        }
    }

    /// Moves up to `INTAKE_BATCH` scheduled timeouts into their buckets.
    fn transfer_intake(&mut self) {
        for _ in 0..INTAKE_BATCH {
            let Ok(timeout) = self.shared.intake.pop() else {
                break;
            };
            if timeout.is_cancelled() {
                // the cancellation drain settles its accounting
                continue;
            }
            let (slot, rounds) = self.wheel.place(timeout.deadline(), self.tick);
            self.wheel.bucket_mut(slot).push(timeout, slot, rounds);
        }
    }
}

/// Settles the pending count for a timeout that never reached a bucket.
/// Only the worker thread may call this; it owns all link state.
fn release_unassigned(timeout: &Timeout, shared: &Shared) {
    unsafe {
        let link = timeout.link_ptr();
        if !(*link).released {
            (*link).released = true;
            shared.pending.fetch_sub(1, AcqRel);
        }
    }
}

#[cfg(windows)]
fn park_granularity(wait: Duration) -> Duration {
    // the scheduler only resolves ~10ms; round down and never ask for zero
    let ms = wait.as_millis() as u64 / 10 * 10;
    Duration::from_millis(ms.max(1))
}

#[cfg(not(windows))]
fn park_granularity(wait: Duration) -> Duration {
    wait
}
