//! Monotonic time sources.
//!
//! Every due-time in the crate is expressed in monotonic milliseconds from
//! an arbitrary origin. [`SystemClock`] anchors that origin at its own
//! construction; [`ManualClock`] hands control of the current instant to
//! the caller, which is what the queue unit tests use to exercise delayed
//! delivery without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A monotonic-millisecond time source.
///
/// `now_millis` and `uptime_millis` are interchangeable monotonic
/// readings; the two names exist because callers historically mix them.
/// Implementations must never run backwards.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic time in milliseconds.
    fn now_millis(&self) -> u64;

    /// Milliseconds since the clock's origin.
    ///
    /// Defaults to [`now_millis`](Self::now_millis); both readings share
    /// the same timeline.
    fn uptime_millis(&self) -> u64 {
        self.now_millis()
    }
}

/// The production clock, anchored to a [`Instant`] taken at construction.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// A test clock advanced explicitly by the caller.
///
/// Reads are atomic, so the clock can be shared between the thread under
/// test and the test body.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a manual clock starting at `start_millis`.
    #[must_use]
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    /// Advances the clock by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute reading.
    ///
    /// Monotonicity is the caller's responsibility; tests use this to
    /// simulate regression scenarios on purpose.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_millis();
        thread::sleep(Duration::from_millis(5));
        let b = clock.now_millis();
        assert!(b >= a);
        assert!(clock.uptime_millis() >= b);
    }

    #[test]
    fn manual_clock_advances_only_on_request() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_millis(), 100);
        clock.advance(50);
        assert_eq!(clock.now_millis(), 150);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }
}
