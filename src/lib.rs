use thiserror::Error;

pub mod comms;
pub mod timer;

/// Error type for all primitives
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("Nothing to pop, no pending items")]
    NoPendingItems,
    #[error("Tick duration must be greater than zero")]
    ZeroTickDuration,
    #[error("Wheel must have at least one slot")]
    ZeroTicksPerWheel,
    #[error("Requested {0} slots, a wheel may not exceed 2^30")]
    WheelTooLarge(usize),
    #[error("Tick of {tick_ns}ns across {slots} slots overflows the deadline range")]
    WheelSpanOverflow { tick_ns: u64, slots: usize },
    #[error("Timer is stopped, no new timeouts can be scheduled")]
    Shutdown,
    #[error("Pending timeouts ({pending}) would exceed the configured maximum ({max})")]
    TooManyPending { pending: u64, max: u64 },
    #[error("stop() cannot be called from the timer worker thread")]
    StopFromWorker,
    #[error("Failed to spawn the timer worker thread: {0}")]
    WorkerSpawn(String),
}
