use alloc::rc::Rc;
use core::cell::Cell;

use embedded_hal::delay::DelayNs;

use crate::clock::Monotonic;

/// Shared fake millisecond counter. Clones observe the same time.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    now: Rc<Cell<u32>>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u32 {
        self.now.get()
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }

    pub fn set(&self, ms: u32) {
        self.now.set(ms);
    }
}

impl Monotonic for SimClock {
    fn now_ms(&self) -> u32 {
        self.now()
    }
}

/// Delay that returns immediately and moves the [`SimClock`] forward instead.
pub struct SimDelay {
    clock: SimClock,
    pending_ns: u32,
}

impl SimDelay {
    pub fn new(clock: SimClock) -> Self {
        Self {
            clock,
            pending_ns: 0,
        }
    }
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        let total = u64::from(self.pending_ns) + u64::from(ns);
        self.clock.advance((total / 1_000_000) as u32);
        self.pending_ns = (total % 1_000_000) as u32;
    }

    fn delay_ms(&mut self, ms: u32) {
        self.clock.advance(ms);
    }
}
