//! Worker counters.
//!
//! Incremented from the trigger loop, the signal handler and safe-point callbacks, so every field
//! is a relaxed atomic. `snapshot` turns them into a serializable view.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct WorkerStats {
    pub(crate) trigger_sample_attempts: AtomicU64,
    pub(crate) trigger_simulated_signal_delivery_attempts: AtomicU64,
    pub(crate) simulated_signal_delivery: AtomicU64,
    pub(crate) signal_handler_enqueued_sample: AtomicU64,
    pub(crate) signal_handler_wrong_thread: AtomicU64,
    pub(crate) sampled: AtomicU64,
    pub(crate) skipped_sample_because_of_dynamic_sampling_rate: AtomicU64,
    pub(crate) postponed_job_skipped_already_existed: AtomicU64,
    pub(crate) postponed_job_success: AtomicU64,
    pub(crate) postponed_job_full: AtomicU64,
    pub(crate) postponed_job_unknown_result: AtomicU64,
    sampling_time_ns_min: AtomicU64,
    sampling_time_ns_max: AtomicU64,
    sampling_time_ns_total: AtomicU64,
    pub(crate) allocations_during_sample: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub trigger_sample_attempts: u64,
    pub trigger_simulated_signal_delivery_attempts: u64,
    pub simulated_signal_delivery: u64,
    pub signal_handler_enqueued_sample: u64,
    pub signal_handler_wrong_thread: u64,
    pub sampled: u64,
    pub skipped_sample_because_of_dynamic_sampling_rate: u64,
    pub postponed_job_skipped_already_existed: u64,
    pub postponed_job_success: u64,
    pub postponed_job_full: u64,
    pub postponed_job_unknown_result: u64,
    /// `None` until something was sampled
    pub sampling_time_ns_min: Option<u64>,
    pub sampling_time_ns_max: Option<u64>,
    pub sampling_time_ns_total: Option<u64>,
    pub sampling_time_ns_avg: Option<f64>,
    pub allocations_during_sample: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            trigger_sample_attempts: AtomicU64::new(0),
            trigger_simulated_signal_delivery_attempts: AtomicU64::new(0),
            simulated_signal_delivery: AtomicU64::new(0),
            signal_handler_enqueued_sample: AtomicU64::new(0),
            signal_handler_wrong_thread: AtomicU64::new(0),
            sampled: AtomicU64::new(0),
            skipped_sample_because_of_dynamic_sampling_rate: AtomicU64::new(0),
            postponed_job_skipped_already_existed: AtomicU64::new(0),
            postponed_job_success: AtomicU64::new(0),
            postponed_job_full: AtomicU64::new(0),
            postponed_job_unknown_result: AtomicU64::new(0),
            // Always min'ed against the latest sample
            sampling_time_ns_min: AtomicU64::new(u64::MAX),
            sampling_time_ns_max: AtomicU64::new(0),
            sampling_time_ns_total: AtomicU64::new(0),
            allocations_during_sample: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_sampling_time(&self, sampling_time_ns: u64) {
        self.sampling_time_ns_min
            .fetch_min(sampling_time_ns, Ordering::Relaxed);
        self.sampling_time_ns_max
            .fetch_max(sampling_time_ns, Ordering::Relaxed);
        self.sampling_time_ns_total
            .fetch_add(sampling_time_ns, Ordering::Relaxed);
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.trigger_sample_attempts,
            &self.trigger_simulated_signal_delivery_attempts,
            &self.simulated_signal_delivery,
            &self.signal_handler_enqueued_sample,
            &self.signal_handler_wrong_thread,
            &self.sampled,
            &self.skipped_sample_because_of_dynamic_sampling_rate,
            &self.postponed_job_skipped_already_existed,
            &self.postponed_job_success,
            &self.postponed_job_full,
            &self.postponed_job_unknown_result,
            &self.sampling_time_ns_max,
            &self.sampling_time_ns_total,
            &self.allocations_during_sample,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.sampling_time_ns_min.store(u64::MAX, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let sampled = load(&self.sampled);
        let min = load(&self.sampling_time_ns_min);
        let max = load(&self.sampling_time_ns_max);
        let total = load(&self.sampling_time_ns_total);

        WorkerStatsSnapshot {
            trigger_sample_attempts: load(&self.trigger_sample_attempts),
            trigger_simulated_signal_delivery_attempts: load(
                &self.trigger_simulated_signal_delivery_attempts,
            ),
            simulated_signal_delivery: load(&self.simulated_signal_delivery),
            signal_handler_enqueued_sample: load(&self.signal_handler_enqueued_sample),
            signal_handler_wrong_thread: load(&self.signal_handler_wrong_thread),
            sampled,
            skipped_sample_because_of_dynamic_sampling_rate: load(
                &self.skipped_sample_because_of_dynamic_sampling_rate,
            ),
            postponed_job_skipped_already_existed: load(&self.postponed_job_skipped_already_existed),
            postponed_job_success: load(&self.postponed_job_success),
            postponed_job_full: load(&self.postponed_job_full),
            postponed_job_unknown_result: load(&self.postponed_job_unknown_result),
            sampling_time_ns_min: (min != u64::MAX).then_some(min),
            sampling_time_ns_max: (max != 0).then_some(max),
            sampling_time_ns_total: (total != 0).then_some(total),
            sampling_time_ns_avg: (sampled != 0).then(|| total as f64 / sampled as f64),
            allocations_during_sample: load(&self.allocations_during_sample),
        }
    }
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}
