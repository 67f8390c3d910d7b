//! A monotonic host-clock abstraction.
//!
//! This core leans on a monotonic host counter in three places: the PIT's
//! `count_load_host_time`, the CMOS periodic-interrupt deadline, and timing
//! generally — this emulator is not cycle-accurate, so device timing is
//! derived from wall-clock elapsed time rather than a counted cycle budget.
//! Centralizing the clock here keeps `aero86-devices` free of
//! `std::time::Instant` directly, which matters on `wasm32-unknown-unknown`
//! where `Instant::now()` panics.

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(target_arch = "wasm32")]
use web_time::Instant;
#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;

/// Source of monotonic microseconds since an arbitrary epoch. Devices only
/// ever compare two readings, never interpret the absolute value.
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

/// The real, host-backed clock.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// A test double whose time only advances when told to. Grounded on the
/// `FakeHostClock` pattern used for timer tests in the wider project this
/// workspace descends from.
#[derive(Debug, Default)]
pub struct FakeClock {
    now_us: AtomicU64,
}

impl FakeClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(start_us),
        }
    }

    pub fn set_us(&self, us: u64) {
        self.now_us.store(us, Ordering::SeqCst);
    }

    pub fn advance_us(&self, delta_us: u64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_on_demand() {
        let clock = FakeClock::new(1000);
        assert_eq!(clock.now_us(), 1000);
        clock.advance_us(500);
        assert_eq!(clock.now_us(), 1500);
        clock.set_us(0);
        assert_eq!(clock.now_us(), 0);
    }
}
