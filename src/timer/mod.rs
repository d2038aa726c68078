//! Hashed timing-wheel timer for coarse-grained timeout scheduling.
//!
//! This module provides `WheelTimer`, a single-worker-thread hashed wheel:
//! arbitrarily many threads schedule and cancel timeouts in O(1), and one
//! dedicated thread advances the wheel tick by tick, expiring whatever came
//! due. Precision is deliberately coarse (one tick), which is what makes the
//! costs constant; it suits I/O timeout workloads where almost every timeout
//! is cancelled before it fires.

use std::sync::atomic::{AtomicU64, AtomicU8};
use std::sync::atomic::Ordering::Acquire;
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crate::comms::gate::Gate;
use crate::comms::mpsc::FunnelQueue;
use crate::timer::timeout::Timeout;

mod bucket;
pub mod hwt;
pub mod timeout;
mod wheel;
mod worker;

/// Boxed error for task bodies to surface failures through.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for units of work that fire on the wheel's worker thread.
pub trait TimerTask: Send + 'static {
    /// Invoked exactly once, on the worker thread, when the timeout expires.
    /// Errors are logged and contained; they never stop the wheel.
    fn run(&self, timeout: &Timeout) -> Result<(), TaskError>;
}

impl<F> TimerTask for F
where
    F: Fn(&Timeout) -> Result<(), TaskError> + Send + 'static,
{
    fn run(&self, timeout: &Timeout) -> Result<(), TaskError> {
        self(timeout)
    }
}

pub(crate) const STATE_INIT: u8 = 0;
pub(crate) const STATE_STARTED: u8 = 1;
pub(crate) const STATE_SHUTDOWN: u8 = 2;

/// State a timer shares between its facade, its worker thread, and every
/// outstanding timeout handle.
pub(crate) struct Shared {
    /// INIT -> STARTED -> SHUTDOWN, never backwards.
    pub state: AtomicU8,
    /// Outstanding (not yet expired or cancelled) timeouts.
    pub pending: AtomicU64,
    /// Backpressure ceiling for `pending`; zero means unlimited.
    pub max_pending: u64,
    /// Publishes the worker's start instant, the epoch all deadlines are
    /// measured from.
    pub start: Gate<Instant>,
    /// Submissions waiting for the worker to place them into buckets.
    pub intake: FunnelQueue<Arc<Timeout>>,
    /// Cancelled handles waiting for the worker to unlink them.
    pub cancellations: Arc<FunnelQueue<Arc<Timeout>>>,
    /// Identity of the worker thread, for the self-stop check.
    pub worker_id: OnceLock<ThreadId>,
}

impl Shared {
    pub fn new(max_pending: u64) -> Self {
        Self {
            state: AtomicU8::new(STATE_INIT),
            pending: AtomicU64::new(0),
            max_pending,
            start: Gate::new(),
            intake: FunnelQueue::new(),
            cancellations: Arc::new(FunnelQueue::new()),
            worker_id: OnceLock::new(),
        }
    }

    pub fn state(&self) -> u8 {
        self.state.load(Acquire)
    }
}

/// Nanoseconds in `d`, saturating instead of wrapping for absurd durations.
pub(crate) fn duration_to_ns(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}
