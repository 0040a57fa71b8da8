//! Dynamic sampling rate governor.
//!
//! Tracks "do not sample before this monotonic timestamp" in a single atomic word, so it can be
//! consulted without any lock from the trigger loop and from the safe-point callback alike.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::runtime::clock::{MILLISECOND_NS, SECOND_NS};

/// Sampling overhead we aim for, as a percentage of wall time
pub const TARGET_OVERHEAD_PERCENT: f64 = 2.0;

/// One slow sample (e.g. right after the host was suspended) never silences sampling for longer
pub const MAX_SLEEP_TIME_NS: u64 = 10 * SECOND_NS;

/// Upper bound for sleep hints, so the trigger loop keeps noticing stop requests
pub const MAX_SLEEP_HINT_NS: u64 = 100 * MILLISECOND_NS;

#[derive(Debug, Default)]
pub struct DynamicSamplingRate {
    next_sample_after_monotonic_wall_time_ns: AtomicU64,
}

impl DynamicSamplingRate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow sampling right away
    pub fn reset(&self) {
        self.next_sample_after_monotonic_wall_time_ns
            .store(0, Ordering::Release);
    }

    pub fn should_sample(&self, wall_time_ns_before_sample: u64) -> bool {
        wall_time_ns_before_sample >= self.next_sample_after()
    }

    /// How long the trigger loop should rest before the next attempt, in nanoseconds
    pub fn sleep_hint_ns(&self, current_monotonic_wall_time_ns: u64) -> u64 {
        let next_sample_after = self.next_sample_after();
        if next_sample_after <= current_monotonic_wall_time_ns {
            return 0;
        }
        (next_sample_after - current_monotonic_wall_time_ns).min(MAX_SLEEP_HINT_NS)
    }

    /// Push the next allowed sample time out proportionally to how long the last sample took
    pub fn after_sample(&self, wall_time_ns_after_sample: u64, sampling_time_ns: u64) {
        let overhead_factor = (100.0 - TARGET_OVERHEAD_PERCENT) / TARGET_OVERHEAD_PERCENT;
        let sleep_time_ns = ((sampling_time_ns as f64) * overhead_factor) as u64;
        let sleep_time_ns = sleep_time_ns.min(MAX_SLEEP_TIME_NS);

        self.next_sample_after_monotonic_wall_time_ns.store(
            wall_time_ns_after_sample.saturating_add(sleep_time_ns),
            Ordering::Release,
        );
    }

    /// Raw "next allowed" timestamp
    pub fn next_sample_after(&self) -> u64 {
        self.next_sample_after_monotonic_wall_time_ns
            .load(Ordering::Acquire)
    }
}
