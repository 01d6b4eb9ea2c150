//! Monotonic time sources.
//!
//! The limiter never reads the wall clock. All accounting runs on a
//! monotonic nanosecond reading supplied by a [`Clock`], and every limiter
//! subtracts its own construction-time anchor from that reading, so cycle
//! numbers always start near zero and a system clock jump can never hand
//! out a burst of phantom permits.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonic nanosecond time source.
///
/// Implementations must be monotonic (readings never decrease) and cheap,
/// since the hot acquisition path reads the clock on every attempt.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current reading in nanoseconds. Only differences between readings
    /// are meaningful; the zero point is implementation-defined.
    fn now_nanos(&self) -> u64;
}

/// The default clock: a process-monotonic reading anchored at the moment
/// the clock was created.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock anchored at the current instant.
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
    fn now_nanos(&self) -> u64 {
        // Saturates after ~584 years of process uptime.
        self.origin.elapsed().as_nanos().min(u64::MAX as u128) as u64
    }
}

/// A clock that only moves when told to.
///
/// Intended for tests and simulations where the exact cycle arithmetic
/// matters: advance time by hand and observe how the limiter reacts,
/// without sleeping.
///
/// ```rust
/// use cyclegate::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// assert_eq!(clock.now_nanos(), 0);
/// clock.advance_nanos(1_500);
/// assert_eq!(clock.now_nanos(), 1_500);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Creates a manual clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manual clock starting at the given reading.
    pub fn starting_at(nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(nanos),
        }
    }

    /// Moves the clock forward by `delta` nanoseconds.
    pub fn advance_nanos(&self, delta: u64) {
        self.nanos.fetch_add(delta, Ordering::SeqCst);
    }

    /// Moves the clock forward by a [`Duration`](std::time::Duration).
    pub fn advance(&self, delta: std::time::Duration) {
        self.advance_nanos(delta.as_nanos().min(u64::MAX as u128) as u64);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let first = clock.now_nanos();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = clock.now_nanos();
        assert!(second > first);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_nanos(), 0);
        assert_eq!(clock.now_nanos(), 0);

        clock.advance_nanos(250);
        assert_eq!(clock.now_nanos(), 250);

        clock.advance(std::time::Duration::from_micros(1));
        assert_eq!(clock.now_nanos(), 1_250);
    }

    #[test]
    fn manual_clock_starting_point() {
        let clock = ManualClock::starting_at(1_000_000);
        assert_eq!(clock.now_nanos(), 1_000_000);
    }
}
