//! Soft real-time pacing primitives for the frame driver thread.
//!
//! `RealTimeScheduler` bundles the three operations the frame loop needs:
//! a best-effort priority request, a monotonic absolute clock, and a precise
//! `wait_until` that sleeps coarsely and spins the last stretch.

pub mod clock;
pub mod priority;

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

pub use clock::{timebase, AbsoluteTime, Timebase};
pub use priority::PriorityResult;

/// Default distance before the deadline at which the coarse sleep hands over
/// to spinning.
pub const DEFAULT_SPIN_THRESHOLD: Duration = Duration::from_millis(1);

/// Pacing primitives for one thread.
#[derive(Debug, Clone, Copy)]
pub struct RealTimeScheduler {
    spin_threshold: Duration,
}

impl Default for RealTimeScheduler {
    fn default() -> Self {
        Self::new(spin_threshold_override().unwrap_or(DEFAULT_SPIN_THRESHOLD))
    }
}

impl RealTimeScheduler {
    pub fn new(spin_threshold: Duration) -> Self {
        Self { spin_threshold }
    }

    pub fn spin_threshold(&self) -> Duration {
        self.spin_threshold
    }

    /// Ask the host to run the *calling* thread in a real-time class, using
    /// `period` as the constraint window hint.
    ///
    /// Never blocks and never fails hard: a refusal is logged and reported,
    /// and the thread keeps its default priority.
    pub fn set_realtime_priority(&self, period: Duration) -> PriorityResult {
        let result = priority::request(period);
        match result {
            PriorityResult::Granted => {
                debug!(period_us = period.as_micros() as u64, "real-time priority granted");
            }
            PriorityResult::Denied => {
                warn!(
                    period_us = period.as_micros() as u64,
                    "real-time priority refused; pacing will be best-effort"
                );
            }
            PriorityResult::Unsupported => {
                debug!("real-time priority not supported on this platform");
            }
        }
        result
    }

    /// Current monotonic time.
    #[inline]
    pub fn absolute_time(&self) -> AbsoluteTime {
        AbsoluteTime::now()
    }

    /// Block until `target` has been reached.
    ///
    /// Sleeps until `spin_threshold` before the target, then spins. Returns
    /// immediately if `target` is already in the past.
    pub fn wait_until(&self, target: AbsoluteTime) {
        loop {
            let now = AbsoluteTime::now();
            if now >= target {
                return;
            }
            let remaining = target.saturating_duration_since(now);
            if remaining <= self.spin_threshold {
                break;
            }
            thread::sleep(remaining - self.spin_threshold);
        }

        while AbsoluteTime::now() < target {
            std::hint::spin_loop();
        }
    }
}

/// `FRAMEPACE_SPIN_THRESHOLD_US`, clamped to 50..=5000 µs.
fn spin_threshold_override() -> Option<Duration> {
    static OVERRIDE: OnceLock<Option<Duration>> = OnceLock::new();
    *OVERRIDE.get_or_init(|| {
        std::env::var("FRAMEPACE_SPIN_THRESHOLD_US")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| Duration::from_micros(v.clamp(50, 5_000)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn waiting_for_the_past_returns_immediately() {
        let scheduler = RealTimeScheduler::default();
        let past = scheduler.absolute_time();
        std::thread::sleep(Duration::from_millis(2));

        let start = Instant::now();
        scheduler.wait_until(past);
        assert!(start.elapsed() < Duration::from_millis(2));
    }

    #[test]
    fn waits_at_least_the_requested_duration() {
        let scheduler = RealTimeScheduler::new(Duration::from_millis(1));
        for ms in [3u64, 8, 17] {
            let d = Duration::from_millis(ms);
            let start = scheduler.absolute_time();
            scheduler.wait_until(start + d);
            let elapsed = scheduler.absolute_time().saturating_duration_since(start);
            assert!(elapsed >= d, "woke early: {elapsed:?} < {d:?}");
            // Generous upper bound: CI machines are noisy.
            assert!(elapsed < d + Duration::from_millis(15), "woke late: {elapsed:?}");
        }
    }

    #[test]
    fn pure_spin_when_threshold_exceeds_wait() {
        let scheduler = RealTimeScheduler::new(Duration::from_millis(50));
        let start = scheduler.absolute_time();
        let d = Duration::from_millis(2);
        scheduler.wait_until(start + d);
        let elapsed = scheduler.absolute_time().saturating_duration_since(start);
        assert!(elapsed >= d);
        assert!(elapsed < d + Duration::from_millis(15));
    }
}
