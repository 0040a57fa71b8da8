//! Logging setup and metrics publication.
//!
//! Metrics go through the `metrics` facade; nothing is recorded unless the host installed a
//! recorder. Publishing happens outside signal and GC-hook context only.

use metrics::gauge;
use tracing_subscriber::EnvFilter;

use crate::thread_context::ThreadContextStats;
use crate::worker::WorkerStatsSnapshot;
use crate::{Error, Result};

/// Install a global fmt subscriber filtered by `filter` (e.g. `"info"` or
/// `"cpu_wall_profiler=debug"`).
///
/// Returns false when a subscriber was already installed.
pub fn init_tracing(filter: &str) -> Result<bool> {
    let filter = EnvFilter::try_new(filter)
        .map_err(|err| Error::Config(format!("Invalid log filter {:?}: {}", filter, err)))?;

    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok())
}

pub fn publish_worker_stats(stats: &WorkerStatsSnapshot) {
    gauge!("profiler.worker.trigger_sample_attempts", stats.trigger_sample_attempts as f64);
    gauge!(
        "profiler.worker.simulated_signal_delivery",
        stats.simulated_signal_delivery as f64
    );
    gauge!("profiler.worker.sampled", stats.sampled as f64);
    gauge!(
        "profiler.worker.skipped_samples",
        stats.skipped_sample_because_of_dynamic_sampling_rate as f64
    );
    gauge!(
        "profiler.worker.allocations_during_sample",
        stats.allocations_during_sample as f64
    );

    gauge!(
        "profiler.worker.signal_handler",
        stats.signal_handler_enqueued_sample as f64,
        "outcome" => "enqueued"
    );
    gauge!(
        "profiler.worker.signal_handler",
        stats.signal_handler_wrong_thread as f64,
        "outcome" => "wrong_thread"
    );

    for (result, count) in [
        ("success", stats.postponed_job_success),
        ("already_existed", stats.postponed_job_skipped_already_existed),
        ("full", stats.postponed_job_full),
        ("unknown", stats.postponed_job_unknown_result),
    ] {
        gauge!("profiler.worker.postponed_job", count as f64, "result" => result);
    }

    if let Some(avg) = stats.sampling_time_ns_avg {
        gauge!("profiler.worker.sampling_time_ns", avg, "stat" => "avg");
    }
    if let Some(max) = stats.sampling_time_ns_max {
        gauge!("profiler.worker.sampling_time_ns", max as f64, "stat" => "max");
    }
}

pub fn publish_thread_context_stats(stats: &ThreadContextStats) {
    gauge!("profiler.thread_context.gc_samples", stats.gc_samples as f64);
    gauge!(
        "profiler.thread_context.gc_samples_missed",
        stats.gc_samples_missed_due_to_missing_context as f64
    );
    gauge!(
        "profiler.thread_context.gc_events_during_sample",
        stats.gc_events_during_sample as f64
    );
}
