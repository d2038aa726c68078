//! Slot geometry for the hashed wheel: tick quantization, deadline
//! placement, and construction-time validation. The wheel itself is plain
//! data owned by the worker thread; all concurrency lives a level up.

use std::time::Duration;

use crate::timer::bucket::Bucket;
use crate::timer::duration_to_ns;
use crate::TimerError;

/// Hard cap on the slot count, matching the widest mask the placement
/// math can hash into without wasting the deadline range.
pub const MAX_TICKS_PER_WHEEL: usize = 1 << 30;

pub struct Wheel {
    buckets: Box<[Bucket]>,
    mask: u64,
    tick_ns: u64,
}

impl Wheel {
    /// Validates the requested geometry and rounds the slot count up to the
    /// next power of two so slot selection is a mask instead of a modulo.
    pub fn new(tick: Duration, ticks_per_wheel: usize) -> Result<Self, TimerError> {
        let tick_ns = duration_to_ns(tick);
        if tick_ns == 0 {
            return Err(TimerError::ZeroTickDuration);
        }
        if ticks_per_wheel == 0 {
            return Err(TimerError::ZeroTicksPerWheel);
        }
        if ticks_per_wheel > MAX_TICKS_PER_WHEEL {
            return Err(TimerError::WheelTooLarge(ticks_per_wheel));
        }
        let slots = ticks_per_wheel.next_power_of_two();
        // one revolution must stay representable in nanoseconds
        if tick_ns >= u64::MAX / slots as u64 {
            return Err(TimerError::WheelSpanOverflow { tick_ns, slots });
        }
        Ok(Self::from_parts(tick_ns, slots))
    }

    /// Assembles a wheel from already-validated parts. `slots` must be a
    /// power of two.
    pub(crate) fn from_parts(tick_ns: u64, slots: usize) -> Self {
        debug_assert!(slots.is_power_of_two());
        let buckets = (0..slots)
            .map(|_| Bucket::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            mask: slots as u64 - 1,
            tick_ns,
        }
    }

    /// Maps an absolute deadline (nanoseconds since the timer started) to a
    /// slot index and the revolutions remaining before it is due, for a
    /// worker currently at tick number `tick`. Deadlines already in the past
    /// clamp to the slot the worker processes next, with zero revolutions.
    pub fn place(&self, deadline: u64, tick: u64) -> (usize, u64) {
        let calculated = deadline / self.tick_ns;
        let rounds = calculated.saturating_sub(tick) / self.buckets.len() as u64;
        let slot = (calculated.max(tick) & self.mask) as usize;
        (slot, rounds)
    }

    /// Absolute elapsed nanoseconds at which tick number `tick` closes.
    pub fn tick_target(&self, tick: u64) -> u64 {
        self.tick_ns.saturating_mul(tick.saturating_add(1))
    }

    pub fn bucket_mut(&mut self, slot: usize) -> &mut Bucket {
        &mut self.buckets[slot]
    }

    pub fn tick_ns(&self) -> u64 {
        self.tick_ns
    }

    pub fn slot_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }
}
