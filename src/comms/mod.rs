//! Multi-producer, single-consumer (MPSC) handoff primitives.
//!
//! This module provides the channels a single dispatch thread uses to take
//! work in from arbitrarily many submitter threads. Currently, the `mpsc`
//! submodule contains an unbounded lock-free funnel queue, while `gate`
//! provides a one-shot latch for publishing a start-of-life value to every
//! waiting thread.
pub mod gate;
pub mod mpsc;
