//! Monotonic time source.
//!
//! Every timing-dependent operation in the client (try timestamps, run-timeout
//! checks, cooldown sleeps, retry back-off) goes through a [`Clock`] rather than
//! calling [`std::time::Instant::now`] or [`tokio::time::sleep`] directly, so that
//! tests can substitute [`MockClock`] and make time advance deterministically.

use futures::future::BoxFuture;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Abstracts a monotonic clock and its sleep primitive.
///
/// Implementations must be cheap to call and safe to share across tasks; the
/// client and runner hold a `Arc<dyn Clock>` and call `now()`/`sleep()` from
/// many concurrently running tries.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current instant according to this clock.
    fn now(&self) -> Instant;

    /// Suspends until `duration` has elapsed, according to this clock.
    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()>;
}

/// The real clock, backed by [`std::time::Instant`] and [`tokio::time::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A virtual clock for tests: `sleep` advances the clock's notion of "now"
/// without actually waiting, then yields once so other tasks can run.
///
/// This plays the same role `tokio::time::pause()`/`advance()` play in
/// other retry/timeout timing tests, but as an explicit seam that can be
/// injected into a single client or query without affecting the whole
/// runtime's clock.
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<Instant>,
}

impl MockClock {
    /// Creates a new mock clock starting at the real current instant.
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Advances the clock by `duration` without suspending the caller.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().expect("mock clock mutex poisoned");
        *now += duration;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.now.lock().expect("mock clock mutex poisoned")
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.advance(duration);
            tokio::task::yield_now().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_now_is_monotonic() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[tokio::test]
    async fn mock_clock_sleep_advances_without_waiting() {
        let clock = MockClock::new();
        let before = clock.now();

        let started = Instant::now();
        clock.sleep(Duration::from_secs(3600)).await;
        let real_elapsed = started.elapsed();

        assert!(clock.now() - before >= Duration::from_secs(3600));
        assert!(real_elapsed < Duration::from_millis(100));
    }

    #[test]
    fn mock_clock_advance_is_cumulative() {
        let clock = MockClock::new();
        let before = clock.now();
        clock.advance(Duration::from_secs(1));
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now() - before, Duration::from_secs(3));
    }
}
