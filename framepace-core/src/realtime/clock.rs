//! Monotonic high-resolution tick source.
//!
//! Ticks are whatever unit the platform counter uses (mach absolute units,
//! QPC counts, or nanoseconds). The tick → nanosecond ratio is queried from the
//! platform once and cached; it is never assumed.

use std::ops::Add;
use std::sync::OnceLock;
use std::time::Duration;

/// Tick → nanosecond ratio: `nanos = ticks * numer / denom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    pub numer: u64,
    pub denom: u64,
}

impl Timebase {
    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        let nanos = ticks as u128 * self.numer as u128 / self.denom as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    pub fn duration_to_ticks(&self, duration: Duration) -> u64 {
        let ticks = duration.as_nanos() * self.denom as u128 / self.numer as u128;
        ticks.min(u64::MAX as u128) as u64
    }

    /// Like [`duration_to_ticks`](Self::duration_to_ticks) but rounds up, so
    /// the tick span is never shorter than `duration`.
    pub fn duration_to_ticks_ceil(&self, duration: Duration) -> u64 {
        let ticks = (duration.as_nanos() * self.denom as u128).div_ceil(self.numer as u128);
        ticks.min(u64::MAX as u128) as u64
    }

    /// Seconds per tick.
    pub fn scale(&self) -> f64 {
        1e-9 * self.numer as f64 / self.denom as f64
    }
}

/// The process-wide timebase, queried on first use.
pub fn timebase() -> Timebase {
    static TIMEBASE: OnceLock<Timebase> = OnceLock::new();
    *TIMEBASE.get_or_init(|| {
        let tb = platform::query_timebase();
        tracing::debug!(numer = tb.numer, denom = tb.denom, "monotonic timebase");
        tb
    })
}

/// A point on the monotonic tick clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsoluteTime(u64);

impl AbsoluteTime {
    pub fn now() -> Self {
        Self(platform::now_ticks())
    }

    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// Seconds since the platform clock's epoch.
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 * timebase().scale()
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: AbsoluteTime) -> Duration {
        timebase().ticks_to_duration(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for AbsoluteTime {
    type Output = AbsoluteTime;

    fn add(self, rhs: Duration) -> AbsoluteTime {
        AbsoluteTime(self.0.saturating_add(timebase().duration_to_ticks_ceil(rhs)))
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use super::Timebase;

    #[allow(deprecated)]
    pub fn query_timebase() -> Timebase {
        let mut info = libc::mach_timebase_info { numer: 0, denom: 0 };
        // SAFETY: `info` is a valid out-pointer for the duration of the call.
        let status = unsafe { libc::mach_timebase_info(&mut info) };
        if status != 0 || info.numer == 0 || info.denom == 0 {
            return Timebase { numer: 1, denom: 1 };
        }
        Timebase {
            numer: info.numer as u64,
            denom: info.denom as u64,
        }
    }

    #[allow(deprecated)]
    pub fn now_ticks() -> u64 {
        // SAFETY: no preconditions.
        unsafe { libc::mach_absolute_time() }
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
mod platform {
    use super::Timebase;

    const NANOS_PER_SEC: u64 = 1_000_000_000;

    pub fn query_timebase() -> Timebase {
        // CLOCK_MONOTONIC reports nanoseconds; the tick is one nanosecond.
        Timebase { numer: 1, denom: 1 }
    }

    pub fn now_ticks() -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid out-pointer; CLOCK_MONOTONIC always exists on Linux/BSD.
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
    }
}

#[cfg(windows)]
mod platform {
    use super::Timebase;
    use windows::Win32::System::Performance::{QueryPerformanceCounter, QueryPerformanceFrequency};

    const NANOS_PER_SEC: u64 = 1_000_000_000;

    pub fn query_timebase() -> Timebase {
        let mut frequency = 0i64;
        // SAFETY: `frequency` is a valid out-pointer.
        let ok = unsafe { QueryPerformanceFrequency(&mut frequency) }.is_ok();
        if !ok || frequency <= 0 {
            return Timebase { numer: 1, denom: 1 };
        }
        Timebase {
            numer: NANOS_PER_SEC,
            denom: frequency as u64,
        }
    }

    pub fn now_ticks() -> u64 {
        let mut counter = 0i64;
        // SAFETY: `counter` is a valid out-pointer.
        let _ = unsafe { QueryPerformanceCounter(&mut counter) };
        counter.max(0) as u64
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    use super::Timebase;
    use std::sync::OnceLock;
    use std::time::Instant;

    pub fn query_timebase() -> Timebase {
        Timebase { numer: 1, denom: 1 }
    }

    pub fn now_ticks() -> u64 {
        static ANCHOR: OnceLock<Instant> = OnceLock::new();
        ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn clock_is_monotonic() {
        let a = AbsoluteTime::now();
        let b = AbsoluteTime::now();
        assert!(b >= a);
    }

    #[test]
    fn timebase_conversions_round_trip() {
        let tb = Timebase {
            numer: 125,
            denom: 3,
        };
        let d = Duration::from_micros(16_683);
        let ticks = tb.duration_to_ticks(d);
        let back = tb.ticks_to_duration(ticks);
        assert!(d.saturating_sub(back) < Duration::from_nanos(125));
        assert_relative_eq!(tb.scale(), 125e-9 / 3.0);
    }

    #[test]
    fn ceil_conversion_never_lands_early() {
        let tb = Timebase {
            numer: 125,
            denom: 3,
        };
        assert_eq!(tb.duration_to_ticks(Duration::from_nanos(1)), 0);
        assert_eq!(tb.duration_to_ticks_ceil(Duration::from_nanos(1)), 1);
        assert_eq!(tb.duration_to_ticks_ceil(Duration::from_nanos(125)), 3);

        for nanos in [1u64, 41, 42, 16_683_350, 1_000_000_007] {
            let d = Duration::from_nanos(nanos);
            let ticks = tb.duration_to_ticks_ceil(d);
            assert!(tb.ticks_to_duration(ticks) >= d, "{nanos} ns landed early");
            assert!(ticks - tb.duration_to_ticks(d) <= 1);
        }
    }

    #[test]
    fn adding_a_duration_advances_by_that_much() {
        let start = AbsoluteTime::now();
        let later = start + Duration::from_millis(250);
        let delta = later.saturating_duration_since(start);
        assert!(delta >= Duration::from_millis(250));
        assert!(delta - Duration::from_millis(250) < Duration::from_micros(1));
        assert_eq!(start.saturating_duration_since(later), Duration::ZERO);
    }

    #[test]
    fn seconds_track_wall_clock() {
        let start = AbsoluteTime::now();
        std::thread::sleep(Duration::from_millis(20));
        let elapsed = AbsoluteTime::now().as_secs_f64() - start.as_secs_f64();
        assert!(elapsed >= 0.019, "elapsed {elapsed}");
        assert!(elapsed < 1.0, "elapsed {elapsed}");
    }
}
