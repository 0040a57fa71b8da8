/*!
# CPU and Wall Time Worker

Drives periodic sampling of the host runtime.

## Architecture

A background thread (the one calling [`CpuAndWallTimeWorker::start`]) runs the trigger loop
without holding the runtime's global lock:

1. **Trigger**: every 10ms, send SIGPROF to the thread holding the global lock. When no thread
   holds it, the idle sampling helper grabs the lock and simulates the signal instead.
2. **Signal handler**: checks it landed on the lock holder and asks the runtime to run
   `sample_from_postponed_job` at its next safe point. Nothing else happens in signal context.
3. **Safe point**: the postponed job consults the dynamic sampling rate and samples every thread
   through the thread context collector.

GC and allocation tracepoints feed the same collector.

## Active instance

The signal handler and postponed jobs receive no arguments, so they find the running worker through
a process-wide pointer. It is published at start and cleared at teardown, both while the global lock
is held. Tracepoint hooks get their own `Arc` handle instead.

## Failures

Errors raised at a safe point stop the worker. The trigger loop then winds down and `start` returns
the stored error on the worker thread. Anomalies in signal context are only counted, see
[`WorkerStatsSnapshot`].
*/

pub mod allocation;
pub mod signal;
pub mod stats;

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use libc::{c_int, c_void, siginfo_t};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::idle_helper::{IdleAction, IdleSamplingHelper};
use crate::runtime::clock::MILLISECOND_NS;
use crate::runtime::{
    AllocatedObject, HostRuntime, PostponedJobResult, ThreadRef, TracepointHooks, TracepointKind,
};
use crate::sampling_rate::DynamicSamplingRate;
use crate::telemetry;
use crate::thread_context::ThreadContextCollector;
use crate::{Error, Result};

pub use allocation::{AllocationSamplingPolicy, EveryNth, Probabilistic};
pub use signal::SigprofHandlerKind;
pub use stats::{WorkerStats, WorkerStatsSnapshot};

use signal::SavedErrno;
use stats::bump;

const MINIMUM_TIME_BETWEEN_SIGNALS_NS: u64 = 10 * MILLISECOND_NS;

/// Read by the signal handler and postponed jobs. Null while no worker runs.
static ACTIVE_SAMPLER: AtomicPtr<WorkerShared> = AtomicPtr::new(ptr::null_mut());

/// Keeps the instance behind `ACTIVE_SAMPLER` alive. Only replaced by the next start.
static RETAINED_SAMPLER: Mutex<Option<Arc<WorkerShared>>> = parking_lot::const_mutex(None);

thread_local! {
    static ALLOCATION_COUNT: Cell<u64> = const { Cell::new(0) };
}

struct WorkerShared {
    config: WorkerConfig,
    runtime: Arc<dyn HostRuntime>,
    thread_context: Arc<ThreadContextCollector>,
    idle_helper: Arc<IdleSamplingHelper>,
    allocation_policy: Arc<dyn AllocationSamplingPolicy>,
    dynamic_sampling_rate: DynamicSamplingRate,
    should_run: AtomicBool,
    /// Bumped by every stop, so `start` can tell a stop raced with it
    stop_generation: AtomicU64,
    during_sample: AtomicBool,
    owner_thread: Mutex<Option<ThreadRef>>,
    stop_thread: Mutex<Option<ThreadRef>>,
    failure: Mutex<Option<Error>>,
    stats: WorkerStats,
}

/// Background sampler for CPU time, wall time, GC and allocations
pub struct CpuAndWallTimeWorker {
    shared: Arc<WorkerShared>,
}

impl CpuAndWallTimeWorker {
    /// Worker sampling allocations every `config.allocation_sample_every` allocations
    pub fn new(
        thread_context: Arc<ThreadContextCollector>,
        idle_helper: Arc<IdleSamplingHelper>,
        config: WorkerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let policy = EveryNth::new(config.allocation_sample_every.unsigned_abs());
        Self::with_allocation_policy(thread_context, idle_helper, config, Arc::new(policy))
    }

    pub fn with_allocation_policy(
        thread_context: Arc<ThreadContextCollector>,
        idle_helper: Arc<IdleSamplingHelper>,
        config: WorkerConfig,
        allocation_policy: Arc<dyn AllocationSamplingPolicy>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(WorkerShared {
                runtime: thread_context.runtime().clone(),
                config,
                thread_context,
                idle_helper,
                allocation_policy,
                dynamic_sampling_rate: DynamicSamplingRate::new(),
                should_run: AtomicBool::new(false),
                stop_generation: AtomicU64::new(0),
                during_sample: AtomicBool::new(false),
                owner_thread: Mutex::new(None),
                stop_thread: Mutex::new(None),
                failure: Mutex::new(None),
                stats: WorkerStats::new(),
            }),
        })
    }

    /// Run the sampling trigger loop on the calling thread until stopped.
    ///
    /// The caller must hold the runtime's global lock; it is released while the loop runs. Returns
    /// the error that stopped sampling, if any.
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let runtime = shared.runtime.as_ref();
        let stop_generation = shared.stop_generation.load(Ordering::SeqCst);

        if let Some(previous) = active_instance() {
            let previous_owner = *previous.owner_thread.lock();
            if previous_owner.is_some_and(|owner| previous.runtime.is_thread_alive(owner)) {
                return Err(Error::AlreadyRunning(
                    "There's already another instance of CpuAndWallTimeWorker active in a different thread"
                        .to_string(),
                ));
            }

            // Re-enabling a tracepoint that is still enabled makes it fire twice
            warn!("Previous sampler thread died without cleaning up, disabling its tracepoints");
            previous.disable_tracepoints();
        }

        let current_thread = runtime.current_thread();
        {
            let mut stop_thread = shared.stop_thread.lock();
            if *stop_thread == Some(current_thread) {
                *stop_thread = None;
                debug!(thread = %current_thread, "Stop requested before sampling started");
                return Ok(());
            }
        }

        // The monotonic clock reference may have changed, e.g. after a fork
        shared.dynamic_sampling_rate.reset();
        *shared.failure.lock() = None;

        set_active_instance(shared);
        *shared.owner_thread.lock() = Some(current_thread);
        shared.should_run.store(true, Ordering::SeqCst);
        if shared.stop_generation.load(Ordering::SeqCst) != stop_generation {
            // The stop already ran and saw `should_run` false; the loop must not start
            shared.should_run.store(false, Ordering::SeqCst);
            debug!(thread = %current_thread, "Stop requested while sampling was starting");
        }

        // Only threads holding the global lock should ever see the signal
        signal::block_sigprof_in_current_thread();

        info!(
            thread = %current_thread,
            gc_profiling_enabled = shared.config.gc_profiling_enabled,
            allocation_counting_enabled = shared.config.allocation_counting_enabled,
            no_signals_workaround_enabled = shared.config.no_signals_workaround_enabled,
            dynamic_sampling_rate_enabled = shared.config.dynamic_sampling_rate_enabled,
            "CpuAndWallTimeWorker started"
        );

        let result = shared.release_lock_and_run_sampling_trigger_loop();

        shared.disable_tracepoints();
        clear_active_instance();
        *shared.owner_thread.lock() = None;
        *shared.stop_thread.lock() = None;

        // Native threads get reused, so the mask must not outlive this loop
        signal::unblock_sigprof_in_current_thread();

        // Signals may still be in flight; never fall back to the default disposition
        let handler_result =
            signal::replace_sigprof_signal_handler_with_empty_handler(handle_sampling_signal);

        telemetry::publish_worker_stats(&shared.stats.snapshot());
        telemetry::publish_thread_context_stats(&shared.thread_context.stats());

        match &result {
            Ok(()) => info!("CpuAndWallTimeWorker stopped"),
            Err(err) => warn!(error = %err, "CpuAndWallTimeWorker stopped after failure"),
        }

        result.and(handler_result)
    }

    /// Ask the loop running on `worker_thread` to stop. If it has not started yet, it will return
    /// right away once it does.
    pub fn request_stop(&self, worker_thread: ThreadRef) {
        *self.shared.stop_thread.lock() = Some(worker_thread);
        self.stop(None);
    }

    /// Stop sampling. Safe to call from any thread and more than once.
    pub fn stop(&self, failure: Option<Error>) {
        self.shared.stop(failure);
    }

    /// True while this instance is the active sampler and its thread is alive
    pub fn is_running(&self) -> bool {
        let is_active = ACTIVE_SAMPLER.load(Ordering::Acquire) == self.shared.as_ptr();
        let owner = *self.shared.owner_thread.lock();
        is_active && owner.is_some_and(|owner| self.shared.runtime.is_thread_alive(owner))
    }

    /// Call in a forked child, before sampling is restarted
    pub fn reset_after_fork(&self) {
        let shared = &self.shared;

        // Nothing may touch the profile while it is being reset
        shared.disable_tracepoints();
        shared.stats.reset();
        shared.idle_helper.reset();
        shared.thread_context.reset_after_fork();

        info!("CpuAndWallTimeWorker reset after fork");
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    pub fn thread_context(&self) -> &Arc<ThreadContextCollector> {
        &self.shared.thread_context
    }

    /// The stored failure that stopped sampling, if any
    pub fn failure(&self) -> Option<Error> {
        self.shared.failure.lock().clone()
    }
}

impl std::fmt::Debug for CpuAndWallTimeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuAndWallTimeWorker")
            .field("config", &self.shared.config)
            .field("should_run", &self.shared.should_run.load(Ordering::Relaxed))
            .field("owner_thread", &*self.shared.owner_thread.lock())
            .finish()
    }
}

impl WorkerShared {
    fn as_ptr(self: &Arc<Self>) -> *mut WorkerShared {
        Arc::as_ptr(self) as *mut WorkerShared
    }

    fn is_active(&self) -> bool {
        ptr::eq(ACTIVE_SAMPLER.load(Ordering::Acquire), self)
    }

    fn release_lock_and_run_sampling_trigger_loop(self: &Arc<Self>) -> Result<()> {
        signal::install_sigprof_signal_handler(handle_sampling_signal, "handle_sampling_signal")?;

        let hooks: Arc<dyn TracepointHooks> = Arc::new(WorkerTracepoints {
            shared: self.clone(),
        });
        if self.config.gc_profiling_enabled {
            self.runtime.enable_tracepoint(TracepointKind::Gc, hooks.clone());
        }
        if self.config.allocation_counting_enabled {
            self.runtime.enable_tracepoint(TracepointKind::NewObject, hooks);
        }

        let mut loop_result = Ok(());
        self.runtime.without_lock(&mut || {
            loop_result = self
                .idle_helper
                .start()
                .and_then(|()| self.run_sampling_trigger_loop());
            self.idle_helper.stop();
        });
        loop_result?;

        match self.failure.lock().clone() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn run_sampling_trigger_loop(&self) -> Result<()> {
        let runtime = self.runtime.as_ref();

        while self.should_run.load(Ordering::Acquire) {
            bump(&self.stats.trigger_sample_attempts);

            if self.config.no_signals_workaround_enabled {
                // No signals at all: samples land whenever the runtime lets us have the lock
                bump(&self.stats.trigger_simulated_signal_delivery_attempts);
                grab_lock_and_sample(runtime);
            } else if let Some(owner) = runtime.lock_owner() {
                // Racy: the handler re-checks it runs on the lock holder
                signal::send_sigprof(owner);
            } else {
                // Idle process. Waiting for the lock here could block the loop for a long time,
                // so the helper does it.
                bump(&self.stats.trigger_simulated_signal_delivery_attempts);
                let runtime = self.runtime.clone();
                let action: IdleAction = Arc::new(move || grab_lock_and_sample(runtime.as_ref()));
                self.idle_helper.request_action(action);
            }

            signal::sleep_for(MINIMUM_TIME_BETWEEN_SIGNALS_NS)?;

            // Separate sleep: the hint may have changed during the first one
            let now_ns = runtime.monotonic_wall_time_ns().unwrap_or(0).max(0) as u64;
            let extra_sleep_ns = self.dynamic_sampling_rate.sleep_hint_ns(now_ns);
            if self.config.dynamic_sampling_rate_enabled && extra_sleep_ns > 0 {
                signal::sleep_for(extra_sleep_ns)?;
            }
        }

        Ok(())
    }

    fn stop(&self, failure: Option<Error>) {
        self.stop_generation.fetch_add(1, Ordering::SeqCst);
        let was_running = self.should_run.swap(false, Ordering::SeqCst);

        if let Some(failure) = failure {
            warn!(error = %failure, "Sampling failed, stopping CpuAndWallTimeWorker");
            *self.failure.lock() = Some(failure);
        }

        // As early as possible, so the runtime stops calling into us
        self.disable_tracepoints();

        if was_running {
            debug!("CpuAndWallTimeWorker stop requested");
        }
    }

    fn disable_tracepoints(&self) {
        self.runtime.disable_tracepoint(TracepointKind::Gc);
        self.runtime.disable_tracepoint(TracepointKind::NewObject);
    }

    /// Signal context: no allocation, no locks, no errors
    fn on_sampling_signal(&self) {
        let runtime = self.runtime.as_ref();

        if !runtime.is_runtime_thread() || !runtime.is_current_thread_holding_lock() {
            bump(&self.stats.signal_handler_wrong_thread);
            return;
        }

        bump(&self.stats.signal_handler_enqueued_sample);

        let counter = match runtime.postponed_job_register_one(sample_from_postponed_job) {
            PostponedJobResult::Full => &self.stats.postponed_job_full,
            PostponedJobResult::Success => &self.stats.postponed_job_success,
            PostponedJobResult::AlreadyExisted => &self.stats.postponed_job_skipped_already_existed,
            PostponedJobResult::Unknown(_) => &self.stats.postponed_job_unknown_result,
        };
        bump(counter);
    }

    /// Run `sample` under the re-entrancy flag, turning errors into a stop. Nested calls leave
    /// the flag as the outer call set it.
    fn safely_call(&self, sample: impl FnOnce(&Self) -> Result<()>) {
        let was_sampling = self.during_sample.swap(true, Ordering::AcqRel);
        if let Err(err) = sample(self) {
            self.stop(Some(err));
        }
        self.during_sample.store(was_sampling, Ordering::Release);
    }

    fn rescued_sample_from_postponed_job(&self) -> Result<()> {
        let runtime = self.runtime.as_ref();
        let wall_time_ns_before_sample = monotonic_wall_time_now_ns(runtime)?;

        if self.config.dynamic_sampling_rate_enabled
            && !self
                .dynamic_sampling_rate
                .should_sample(wall_time_ns_before_sample.max(0) as u64)
        {
            bump(&self.stats.skipped_sample_because_of_dynamic_sampling_rate);
            return Ok(());
        }

        bump(&self.stats.sampled);

        // Profiler overhead is attributed to the worker thread's stack
        let profiler_overhead_stack_thread =
            (*self.owner_thread.lock()).unwrap_or_else(|| runtime.current_thread());
        self.thread_context
            .sample(wall_time_ns_before_sample, profiler_overhead_stack_thread)?;

        let wall_time_ns_after_sample = monotonic_wall_time_now_ns(runtime)?;
        // Wall time can go backwards
        let sampling_time_ns = (wall_time_ns_after_sample - wall_time_ns_before_sample).max(0) as u64;

        self.stats.record_sampling_time(sampling_time_ns);
        self.dynamic_sampling_rate
            .after_sample(wall_time_ns_after_sample.max(0) as u64, sampling_time_ns);

        Ok(())
    }

    fn on_new_object(&self, object: &AllocatedObject) {
        let allocation_count = ALLOCATION_COUNT.with(|count| {
            let next = count.get().wrapping_add(1);
            count.set(next);
            next
        });

        if !self.is_active() {
            return;
        }

        // Sampling itself allocates
        if self.during_sample.load(Ordering::Acquire) {
            bump(&self.stats.allocations_during_sample);
            return;
        }

        self.safely_call(|shared| match shared.allocation_policy.sample_weight(allocation_count) {
            Some(weight) => shared.thread_context.sample_allocation(weight, object),
            None => Ok(()),
        });
    }
}

/// Tracepoint callbacks, holding their own handle on the worker
struct WorkerTracepoints {
    shared: Arc<WorkerShared>,
}

impl TracepointHooks for WorkerTracepoints {
    fn on_gc_enter(&self) {
        if self.shared.is_active() {
            self.shared.thread_context.on_gc_start();
        }
    }

    fn on_gc_exit(&self) {
        if !self.shared.is_active() {
            return;
        }
        self.shared.thread_context.on_gc_finish();

        // Allocation is forbidden here; the GC samples are taken at the next safe point
        self.shared
            .runtime
            .postponed_job_register_one(after_gc_from_postponed_job);
    }

    fn on_new_object(&self, object: &AllocatedObject) {
        self.shared.on_new_object(object);
    }
}

fn monotonic_wall_time_now_ns(runtime: &dyn HostRuntime) -> Result<i64> {
    runtime
        .monotonic_wall_time_ns()
        .ok_or_else(|| Error::Clock("Failed to read CLOCK_MONOTONIC".to_string()))
}

fn set_active_instance(shared: &Arc<WorkerShared>) {
    let mut retained = RETAINED_SAMPLER.lock();
    ACTIVE_SAMPLER.store(shared.as_ptr(), Ordering::Release);
    *retained = Some(shared.clone());
}

fn clear_active_instance() {
    ACTIVE_SAMPLER.store(ptr::null_mut(), Ordering::Release);
}

fn active_instance() -> Option<Arc<WorkerShared>> {
    let retained = RETAINED_SAMPLER.lock();
    let active = ACTIVE_SAMPLER.load(Ordering::Acquire);
    retained
        .as_ref()
        .filter(|shared| shared.as_ptr() == active)
        .cloned()
}

fn with_active_sampler(f: impl FnOnce(&WorkerShared)) {
    let active = ACTIVE_SAMPLER.load(Ordering::Acquire);
    // SAFETY: a non-null pointer was published from the Arc kept in RETAINED_SAMPLER, which is
    // only dropped when a later start publishes a different instance.
    if let Some(shared) = unsafe { active.as_ref() } {
        f(shared);
    }
}

extern "C" fn handle_sampling_signal(_signal: c_int, _info: *mut siginfo_t, _ucontext: *mut c_void) {
    let _errno = SavedErrno::save();
    with_active_sampler(WorkerShared::on_sampling_signal);
}

fn sample_from_postponed_job() {
    with_active_sampler(|shared| shared.safely_call(WorkerShared::rescued_sample_from_postponed_job));
}

fn after_gc_from_postponed_job() {
    with_active_sampler(|shared| {
        shared.safely_call(|shared| shared.thread_context.sample_after_gc())
    });
}

/// Runs with the global lock held, on behalf of a thread that does not hold it
fn simulate_sampling_signal_delivery() {
    with_active_sampler(|shared| {
        bump(&shared.stats.simulated_signal_delivery);
        // Through the signal handler so the simulated path counts the same stats as the real one
        shared.on_sampling_signal();
    });
}

fn grab_lock_and_sample(runtime: &dyn HostRuntime) {
    runtime.with_lock(&mut simulate_sampling_signal_delivery);
}

/// Allocations seen on the current thread, or `None` when no worker is active
pub fn allocation_count() -> Option<u64> {
    if ACTIVE_SAMPLER.load(Ordering::Acquire).is_null() {
        return None;
    }
    Some(ALLOCATION_COUNT.with(Cell::get))
}

/// Testing hook: take a sample right now, as if the postponed job had run
pub fn trigger_sample() {
    sample_from_postponed_job();
}

/// Testing hook: run the signal handler on the current thread
pub fn simulate_handle_sampling_signal() {
    handle_sampling_signal(0, ptr::null_mut(), ptr::null_mut());
}

/// Testing hook
pub fn simulate_sample_from_postponed_job() {
    sample_from_postponed_job();
}

pub fn is_sigprof_blocked_in_current_thread() -> bool {
    signal::is_sigprof_blocked_in_current_thread()
}

pub fn with_blocked_sigprof<T>(f: impl FnOnce() -> T) -> T {
    signal::with_blocked_sigprof(f)
}

pub fn install_testing_signal_handler() -> Result<()> {
    signal::install_testing_signal_handler()
}

pub fn remove_testing_signal_handler() -> Result<()> {
    signal::remove_sigprof_signal_handler()
}

/// Which handler currently owns SIGPROF, `None` for the default disposition
pub fn current_sigprof_signal_handler() -> Result<Option<SigprofHandlerKind>> {
    signal::current_sigprof_signal_handler(handle_sampling_signal)
}
