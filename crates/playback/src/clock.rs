//! Clock abstractions: the system clock and the audio output device's
//! position reporting.

use std::time::Instant;

/// Monotonic microsecond clock.
pub trait ClockSource: Send + Sync {
    fn now_us(&self) -> i64;
}

/// Real system clock anchored at construction.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for SystemClock {
    fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }
}

/// Manually driven clock for tests and headless simulation.
pub struct ManualClock {
    now_us: parking_lot::Mutex<i64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now_us: parking_lot::Mutex::new(0),
        }
    }

    pub fn advance_us(&self, by: i64) {
        *self.now_us.lock() += by;
    }

    pub fn set_us(&self, value: i64) {
        *self.now_us.lock() = value;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for ManualClock {
    fn now_us(&self) -> i64 {
        *self.now_us.lock()
    }
}

#[cfg(test)]
#[cfg_attr(all(test, coverage_nightly), coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_us();
        let b = clock.now_us();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_us(), 0);
        clock.advance_us(500);
        assert_eq!(clock.now_us(), 500);
        clock.set_us(42);
        assert_eq!(clock.now_us(), 42);
    }
}
