//! POSIX clock helpers.
//!
//! All readers return `None` instead of failing so they can be used from GC hooks, where raising
//! is not allowed.

use serde::{Deserialize, Serialize};

pub const SECOND_NS: u64 = 1_000_000_000;
pub const MILLISECOND_NS: u64 = 1_000_000;

/// Handle to a per-thread CPU-time clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CpuClockId(pub libc::clockid_t);

fn clock_now_ns(clock: libc::clockid_t) -> Option<i64> {
    // SAFETY: timespec is plain old data; `now` stays valid and writable for the call.
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::clock_gettime(clock, &mut now) };
    if result != 0 {
        return None;
    }
    Some(now.tv_sec as i64 * SECOND_NS as i64 + now.tv_nsec as i64)
}

/// Monotonic clock, in nanoseconds
pub fn monotonic_now_ns() -> Option<i64> {
    clock_now_ns(libc::CLOCK_MONOTONIC)
}

/// Wall clock since the unix epoch, in nanoseconds
pub fn system_epoch_now_ns() -> Option<i64> {
    clock_now_ns(libc::CLOCK_REALTIME)
}

/// CPU clock of an arbitrary native thread
#[cfg(target_os = "linux")]
pub fn cpu_clock_for_pthread(thread: libc::pthread_t) -> Option<CpuClockId> {
    let mut clock_id: libc::clockid_t = 0;
    // SAFETY: `clock_id` is a valid out-pointer; an unknown thread yields an error code.
    let result = unsafe { libc::pthread_getcpuclockid(thread, &mut clock_id) };
    (result == 0).then_some(CpuClockId(clock_id))
}

#[cfg(not(target_os = "linux"))]
pub fn cpu_clock_for_pthread(_thread: libc::pthread_t) -> Option<CpuClockId> {
    None
}

/// CPU clock of the calling thread
pub fn current_thread_cpu_clock() -> Option<CpuClockId> {
    // SAFETY: pthread_self has no preconditions.
    cpu_clock_for_pthread(unsafe { libc::pthread_self() })
}

/// CPU time consumed so far on the clock's thread
pub fn read_cpu_clock(clock: CpuClockId) -> Option<i64> {
    clock_now_ns(clock.0)
}

/// Converts monotonic timestamps into epoch timestamps.
///
/// The delta between both clocks is captured on first use and reused afterwards, so that all
/// converted timestamps of a profile move together even if the wall clock gets adjusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonotonicToEpoch {
    pub system_epoch_ns_reference: Option<i64>,
    pub delta_to_epoch_ns: Option<i64>,
}

impl MonotonicToEpoch {
    /// Convert `monotonic_ns`, initializing the delta from `now` (epoch, monotonic) if needed
    pub fn convert(
        &mut self,
        monotonic_ns: i64,
        now: impl FnOnce() -> Option<(i64, i64)>,
    ) -> Option<i64> {
        let delta = match self.delta_to_epoch_ns {
            Some(delta) => delta,
            None => {
                let (epoch_ns, current_monotonic_ns) = now()?;
                let delta = epoch_ns - current_monotonic_ns;
                self.system_epoch_ns_reference = Some(epoch_ns);
                self.delta_to_epoch_ns = Some(delta);
                delta
            }
        };
        Some(monotonic_ns + delta)
    }
}
