//! Timeout handles: one scheduled unit of work and its lifecycle state.

use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::sync::{Arc, Weak};

use log::{error, warn};

use crate::comms::mpsc::FunnelQueue;
use crate::timer::TimerTask;

const ST_PENDING: u8 = 0;
const ST_CANCELLED: u8 = 1;
const ST_EXPIRED: u8 = 2;

/// Wheel-placement bookkeeping for one timeout. Lives behind an `UnsafeCell`
/// and is only ever read or written by the worker thread.
pub(crate) struct Link {
    pub prev: *const Timeout,
    pub next: *const Timeout,
    /// Slot of the bucket currently holding this timeout, if any.
    pub bucket: Option<usize>,
    /// Full wheel revolutions left before the entry is due.
    pub rounds: u64,
    /// Set once the worker has released this timeout from its pending-count
    /// accounting, making the decrement idempotent across removal paths.
    pub released: bool,
}

/// A scheduled unit of work, handed back from `schedule` as `Arc<Timeout>`.
///
/// The handle is freely shareable across threads: callers query or cancel it
/// through the atomic state machine, while the wheel's worker thread owns the
/// intrusive placement state exclusively. Exactly one of cancel or expire ever
/// wins, decided by a compare-and-swap.
pub struct Timeout {
    task: Box<dyn TimerTask>,
    /// Nanoseconds after the wheel's start instant at which this fires.
    deadline: u64,
    state: AtomicU8,
    /// Route back to the worker for cancellations. Weak, so handles that
    /// outlive their timer cannot keep its queues alive in a cycle.
    cancellations: Weak<FunnelQueue<Arc<Timeout>>>,
    /// Back-reference to our own `Arc`, so cancel() can enqueue an owned
    /// handle from a plain `&self`.
    this: Weak<Timeout>,
    /// Intrusive list state; worker thread only.
    link: UnsafeCell<Link>,
}

impl Timeout {
    pub(crate) fn new(
        task: Box<dyn TimerTask>,
        deadline: u64,
        cancellations: Weak<FunnelQueue<Arc<Timeout>>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            task,
            deadline,
            state: AtomicU8::new(ST_PENDING),
            cancellations,
            this: this.clone(),
            link: UnsafeCell::new(Link {
                prev: ptr::null(),
                next: ptr::null(),
                bucket: None,
                rounds: 0,
                released: false,
            }),
        })
    }

    /// True while neither cancelled nor expired.
    pub fn is_pending(&self) -> bool {
        self.state.load(Acquire) == ST_PENDING
    }

    /// True once the task has been (or is being) run by the worker.
    pub fn is_expired(&self) -> bool {
        self.state.load(Acquire) == ST_EXPIRED
    }

    /// True once a cancel call has won the state race.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Acquire) == ST_CANCELLED
    }

    /// Attempts to cancel this timeout.
    ///
    /// Returns true if this call won; the task will never run and the worker
    /// unlinks the entry within one tick. Returns false without side effects
    /// if the timeout already expired or was already cancelled. Never blocks.
    pub fn cancel(&self) -> bool {
        if self
            .state
            .compare_exchange(ST_PENDING, ST_CANCELLED, AcqRel, Acquire)
            .is_err()
        {
            return false;
        }
        // Hand ourselves to the worker for unlinking on its next tick. A
        // timer that has already been torn down has no worker left to care.
        if let (Some(queue), Some(handle)) = (self.cancellations.upgrade(), self.this.upgrade()) {
            queue.push(handle);
        }
        true
    }

    /// Runs the task if this timeout is still pending. Worker thread only.
    ///
    /// Task failures and panics are contained here so one bad callback cannot
    /// take the wheel down with it.
    pub(crate) fn expire(&self) {
        if self
            .state
            .compare_exchange(ST_PENDING, ST_EXPIRED, AcqRel, Acquire)
            .is_err()
        {
            return;
        }
        match catch_unwind(AssertUnwindSafe(|| self.task.run(self))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("timer task failed: {e}"),
            Err(_) => error!("timer task panicked, wheel continues"),
        }
    }

    pub(crate) fn deadline(&self) -> u64 {
        self.deadline
    }

    pub(crate) fn link_ptr(&self) -> *mut Link {
        self.link.get()
    }
}

// Handles cross threads freely: `task` is Send and only ever invoked on the
// worker thread, the state machine is atomic, and the link block is
// exclusively the worker's.
unsafe impl Send for Timeout {}
unsafe impl Sync for Timeout {}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Acquire) {
            ST_PENDING => "pending",
            ST_CANCELLED => "cancelled",
            _ => "expired",
        };
        f.debug_struct("Timeout")
            .field("deadline_ns", &self.deadline)
            .field("state", &state)
            .finish()
    }
}
