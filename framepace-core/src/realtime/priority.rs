//! Platform real-time priority requests for the frame driver thread.
//!
//! - **macOS**: Mach time-constraint policy built from the frame period
//! - **Windows**: MMCSS "Games" task, falling back to `THREAD_PRIORITY_TIME_CRITICAL`
//! - **Linux / other unix**: `SCHED_FIFO`, falling back to `SCHED_RR`
//!
//! Every request is best-effort. A refusal leaves the thread at its default
//! priority; the frame loop still runs, only with more jitter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of a priority request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityResult {
    /// The host scheduler accepted the request.
    Granted,
    /// The host refused (missing privileges, quota, invalid period).
    Denied,
    /// No real-time class is available on this platform.
    Unsupported,
}

impl PriorityResult {
    pub fn is_granted(self) -> bool {
        self == PriorityResult::Granted
    }
}

pub(crate) fn request(period: Duration) -> PriorityResult {
    if period.is_zero() {
        return PriorityResult::Denied;
    }
    platform_request(period)
}

#[cfg(target_os = "macos")]
fn platform_request(period: Duration) -> PriorityResult {
    use super::clock::timebase;

    const THREAD_TIME_CONSTRAINT_POLICY: u32 = 2;
    const THREAD_TIME_CONSTRAINT_POLICY_COUNT: u32 = 4;

    #[repr(C)]
    struct ThreadTimeConstraintPolicy {
        period: u32,
        computation: u32,
        constraint: u32,
        preemptible: i32,
    }

    extern "C" {
        fn mach_thread_self() -> u32;
        fn thread_policy_set(
            thread: u32,
            flavor: u32,
            policy_info: *const ThreadTimeConstraintPolicy,
            count: u32,
        ) -> i32;
    }

    let tb = timebase();
    let to_ticks = |d: Duration| tb.duration_to_ticks(d).min(u32::MAX as u64) as u32;

    // Ask for just under half the period as guaranteed computation and the
    // whole period as the constraint window.
    let policy = ThreadTimeConstraintPolicy {
        period: to_ticks(period),
        computation: to_ticks(period.mul_f64(0.45)),
        constraint: to_ticks(period),
        preemptible: 1,
    };

    // SAFETY: `policy` matches `thread_time_constraint_policy_data_t` and lives
    // for the whole call; the port names the calling thread.
    let result = unsafe {
        thread_policy_set(
            mach_thread_self(),
            THREAD_TIME_CONSTRAINT_POLICY,
            &policy,
            THREAD_TIME_CONSTRAINT_POLICY_COUNT,
        )
    };

    if result == 0 {
        PriorityResult::Granted
    } else {
        tracing::debug!(result, "thread_policy_set refused time-constraint policy");
        PriorityResult::Denied
    }
}

#[cfg(windows)]
fn platform_request(_period: Duration) -> PriorityResult {
    use windows::core::PCWSTR;
    use windows::Win32::System::Threading::{
        AvSetMmThreadCharacteristicsW, GetCurrentThread, SetThreadPriority,
        THREAD_PRIORITY_TIME_CRITICAL,
    };

    let task_name: Vec<u16> = "Games\0".encode_utf16().collect();
    let mut task_index: u32 = 0;
    // SAFETY: `task_name` is NUL-terminated and outlives the call.
    let mmcss = unsafe { AvSetMmThreadCharacteristicsW(PCWSTR(task_name.as_ptr()), &mut task_index) };
    if let Ok(handle) = mmcss {
        if !handle.is_invalid() {
            tracing::debug!(task_index, "MMCSS Games class registered");
            return PriorityResult::Granted;
        }
    }

    tracing::debug!("MMCSS registration failed, falling back to thread priority");
    // SAFETY: the pseudo-handle of the current thread is always valid.
    let result = unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL) };
    if result.is_ok() {
        PriorityResult::Granted
    } else {
        PriorityResult::Denied
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
fn platform_request(_period: Duration) -> PriorityResult {
    // SAFETY: `pthread_self` has no preconditions.
    let thread = unsafe { libc::pthread_self() };

    // Leave headroom above us for kernel threads and the audio server.
    let param = libc::sched_param { sched_priority: 60 };
    // SAFETY: `param` is valid for the call and `thread` is the calling thread.
    let result = unsafe { libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &param) };
    if result == 0 {
        return PriorityResult::Granted;
    }

    tracing::debug!(errno = result, "SCHED_FIFO refused, trying SCHED_RR");
    let param = libc::sched_param { sched_priority: 50 };
    // SAFETY: as above.
    let result = unsafe { libc::pthread_setschedparam(thread, libc::SCHED_RR, &param) };
    if result == 0 {
        PriorityResult::Granted
    } else {
        tracing::debug!(errno = result, "all real-time scheduling classes refused");
        PriorityResult::Denied
    }
}

#[cfg(not(any(unix, windows)))]
fn platform_request(_period: Duration) -> PriorityResult {
    PriorityResult::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_period_is_denied_without_touching_the_scheduler() {
        assert_eq!(request(Duration::ZERO), PriorityResult::Denied);
    }

    #[test]
    fn result_serializes_lowercase() {
        let json = serde_json::to_value(PriorityResult::Granted).expect("serialize");
        assert_eq!(json, "granted");
        assert!(PriorityResult::Granted.is_granted());
        assert!(!PriorityResult::Unsupported.is_granted());
    }
}
