//! Monotonic time source for all benchmark measurements.
//!
//! Every timestamp in the engine is a nanosecond offset from a fixed epoch
//! established when the run starts. Wall-clock time never enters any
//! measurement; it is recorded once, for the report header.

use tokio::time::{Duration, Instant};

/// Monotonic nanosecond clock anchored at a fixed epoch.
///
/// `Clock` is `Copy` so workers and adapters each hold their own handle to
/// the same epoch. Timestamps from different handles of one clock are
/// directly comparable.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    /// Establishes a new epoch at the current instant.
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since the epoch.
    pub fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    /// Converts an epoch offset back into an `Instant` for timer APIs.
    pub fn instant_at(&self, offset_ns: u64) -> Instant {
        self.origin + Duration::from_nanos(offset_ns)
    }

    /// Sleeps until the given epoch offset.
    ///
    /// Returns immediately if the offset is already in the past. Callers that
    /// need to abandon the wait early (cancellation, completion events) race
    /// this future inside `tokio::select!`; dropping it cancels the timer.
    pub async fn sleep_until(&self, offset_ns: u64) {
        tokio::time::sleep_until(self.instant_at(offset_ns)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn now_advances_monotonically() {
        let clock = Clock::start();
        let a = clock.now_ns();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let b = clock.now_ns();
        assert!(b >= a + 5_000_000, "expected >=5ms advance, got {}ns", b - a);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_honors_target() {
        let clock = Clock::start();
        clock.sleep_until(20_000_000).await;
        assert!(clock.now_ns() >= 20_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_past_returns_immediately() {
        let clock = Clock::start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = clock.now_ns();
        clock.sleep_until(1_000_000).await;
        // Paused clock: no time may pass for an already-expired target.
        assert_eq!(clock.now_ns(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn copies_share_the_epoch() {
        let clock = Clock::start();
        let copy = clock;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let a = clock.now_ns();
        let b = copy.now_ns();
        assert_eq!(a, b);
    }
}
