//! One-shot latch for publishing a single value to many waiting threads.
//!
//! This module provides `Gate`, which starts closed, is opened exactly once
//! with a value, and from then on hands a copy of that value to every caller.
//! Waiters block until the gate opens; once open, reads are lock-free. Ideal
//! for start-of-life handshakes where one thread establishes a fact (an
//! epoch, a start instant) that every other participant must observe before
//! proceeding.

use std::sync::{Condvar, Mutex, OnceLock, PoisonError};

/// A one-shot open-once latch carrying a value of type `T`.
#[derive(Debug)]
pub struct Gate<T> {
    /// The published value; empty until the gate opens.
    value: OnceLock<T>,
    /// Pairing lock for the condvar. Never held while the gate is open.
    lock: Mutex<()>,
    cond: Condvar,
}

impl<T: Clone> Default for Gate<T> {
    /// Creates a new closed `Gate`.
    fn default() -> Self {
        Gate::new()
    }
}

impl<T: Clone> Gate<T> {
    /// Creates a new closed `Gate`.
    pub fn new() -> Self {
        Self {
            value: OnceLock::new(),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Opens the gate with `value`, waking every waiter.
    ///
    /// Returns true if this call opened the gate, false if it was already
    /// open (the original value is kept in that case).
    pub fn open(&self, value: T) -> bool {
        if self.value.set(value).is_err() {
            return false;
        }
        // Waiters re-check the value under this lock before sleeping, so
        // cycling the lock between set and notify means no waiter can park
        // after missing both.
        drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
        self.cond.notify_all();
        true
    }

    /// Blocks until the gate is open and returns a copy of the value.
    pub fn wait(&self) -> T {
        // Lock-free once the gate has opened.
        if let Some(value) = self.value.get() {
            return value.clone();
        }
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = self.value.get() {
                return value.clone();
            }
            guard = self
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking read of the published value, if any.
    pub fn try_get(&self) -> Option<T> {
        self.value.get().cloned()
    }

    /// True once the gate has been opened.
    pub fn is_open(&self) -> bool {
        self.value.get().is_some()
    }
}
