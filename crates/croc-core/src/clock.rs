//! Monotonic millisecond time base
//!
//! Everything that schedules work (sample timers, sync deadlines, modem
//! timeouts) uses a free-running 32-bit millisecond counter. The counter wraps
//! after ~49.7 days, so comparisons go through [`deadline_reached`] and
//! [`elapsed_ms`] rather than plain `>=` / `-`.

/// A free-running millisecond counter that never jumps backwards.
pub trait Monotonic {
    /// Milliseconds since boot, wrapping at `u32::MAX`.
    fn now_ms(&self) -> u32;
}

impl<T: Monotonic + ?Sized> Monotonic for &T {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}

/// True once `now` is at or past `deadline`, tolerant of counter wrap.
#[inline]
pub fn deadline_reached(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) < 0x8000_0000
}

/// Milliseconds elapsed from `since` to `now`.
#[inline]
pub fn elapsed_ms(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

/// Milliseconds remaining until `deadline`, zero once it has passed.
#[inline]
pub fn remaining_ms(now: u32, deadline: u32) -> u32 {
    if deadline_reached(now, deadline) {
        0
    } else {
        deadline.wrapping_sub(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_reached_plain() {
        assert!(!deadline_reached(999, 1000));
        assert!(deadline_reached(1000, 1000));
        assert!(deadline_reached(1001, 1000));
    }

    #[test]
    fn test_deadline_reached_across_wrap() {
        let deadline = 10u32;
        let before = u32::MAX - 5;
        assert!(!deadline_reached(before, deadline));
        assert!(deadline_reached(12, deadline));
        assert_eq!(elapsed_ms(4, u32::MAX - 5), 10);
    }

    #[test]
    fn test_remaining_ms() {
        assert_eq!(remaining_ms(100, 250), 150);
        assert_eq!(remaining_ms(300, 250), 0);
    }
}
