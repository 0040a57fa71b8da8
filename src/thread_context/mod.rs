/*!
# Thread Context Collector

Per-thread bookkeeping that turns raw clock readings into CPU and wall time deltas, and drives the
stack sampler for every live thread.

## Entry points

- `sample`: one sample per live thread, plus a sample of the profiler's own overhead
- `on_gc_start` / `on_gc_finish`: record GC timestamps; run inside GC, so they never allocate or fail
- `sample_after_gc`: emit the pending GC samples once allocation is allowed again
- `sample_allocation`: one weighted allocation sample for the current thread

## Time accounting

Each context remembers the CPU and wall time of its previous sample. A sample is charged the time
elapsed since then, except while a GC is in progress: time up to GC start goes to the regular
sample and the GC period itself is charged by `sample_after_gc`. Several GC cycles that happen
before `sample_after_gc` runs are reported as a single period from the first start to the last
finish.

## Locking

All state sits behind one mutex, taken by the sampling entry points. The GC hooks only `try_lock`
it: a GC triggered by an allocation made while sampling must not deadlock, so such events are
counted and dropped.
*/

pub mod labels;
pub mod per_thread;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ThreadContextConfig;
use crate::recorder::{Label, SampleValues, StackRecorder};
use crate::runtime::{AllocatedObject, HostRuntime, MonotonicToEpoch, ThreadRef};
use crate::stack::{self, SampleLabels, SampleType, SamplingBuffer};
use crate::{Error, Result};

pub use per_thread::{update_time_since_previous_sample, GcTracking, PerThreadContext, TimeKind};

/// Dead-thread sweep period, in calls to `sample`
const CLEAN_UP_EVERY_N_SAMPLES: u64 = 100;

struct CollectorState {
    contexts: HashMap<ThreadRef, PerThreadContext>,
    sample_count: u64,
    buffer: SamplingBuffer,
    thread_list: Vec<ThreadRef>,
    time_converter: MonotonicToEpoch,
}

#[derive(Debug, Default)]
struct CollectorStats {
    gc_samples: AtomicU64,
    gc_samples_missed_due_to_missing_context: AtomicU64,
    gc_events_during_sample: AtomicU64,
}

/// Snapshot of collector counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadContextStats {
    pub gc_samples: u64,
    pub gc_samples_missed_due_to_missing_context: u64,
    /// GC hooks that fired while the collector itself was busy
    pub gc_events_during_sample: u64,
}

struct TraceIdentifiers {
    local_root_span_id: u64,
    span_id: u64,
    endpoint: Option<String>,
}

struct ThreadSample<'a> {
    thread: ThreadRef,
    stack_from_thread: ThreadRef,
    values: SampleValues,
    sample_type: SampleType,
    current_monotonic_wall_time_ns: Option<i64>,
    ruby_vm_type: Option<&'static str>,
    class_name: Option<&'a str>,
}

pub struct ThreadContextCollector {
    runtime: Arc<dyn HostRuntime>,
    recorder: Arc<StackRecorder>,
    config: ThreadContextConfig,
    main_thread: ThreadRef,
    state: Mutex<CollectorState>,
    stats: CollectorStats,
}

impl ThreadContextCollector {
    pub fn new(
        runtime: Arc<dyn HostRuntime>,
        recorder: Arc<StackRecorder>,
        config: ThreadContextConfig,
    ) -> Result<Self> {
        config.validate()?;
        let buffer = SamplingBuffer::new(config.max_frames)?;
        let main_thread = runtime.main_thread();

        Ok(Self {
            runtime,
            recorder,
            config,
            main_thread,
            state: Mutex::new(CollectorState {
                contexts: HashMap::new(),
                sample_count: 0,
                buffer,
                thread_list: Vec::new(),
                time_converter: MonotonicToEpoch::default(),
            }),
            stats: CollectorStats::default(),
        })
    }

    pub fn recorder(&self) -> &Arc<StackRecorder> {
        &self.recorder
    }

    pub fn runtime(&self) -> &Arc<dyn HostRuntime> {
        &self.runtime
    }

    /// Sample every live thread, then record the profiler's overhead on the current thread using
    /// `stack_from_thread`'s stack
    pub fn sample(&self, current_monotonic_wall_time_ns: i64, stack_from_thread: ThreadRef) -> Result<()> {
        let runtime = self.runtime.as_ref();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let current_thread = runtime.current_thread();
        // Read before sampling anything, so the sampling work is not charged to this thread
        let current_cpu_time_at_sample_start_ns =
            context_for(&mut state.contexts, runtime, current_thread).cpu_time_now_ns(runtime);

        let mut threads = std::mem::take(&mut state.thread_list);
        threads.clear();
        runtime.thread_list(&mut threads);

        let result = threads.iter().try_for_each(|&thread| {
            let current_cpu_time_ns = if thread == current_thread {
                current_cpu_time_at_sample_start_ns
            } else {
                context_for(&mut state.contexts, runtime, thread).cpu_time_now_ns(runtime)
            };
            self.update_metrics_and_sample(
                state,
                thread,
                thread,
                current_cpu_time_ns,
                current_monotonic_wall_time_ns,
            )
        });
        state.thread_list = threads;
        result?;

        state.sample_count += 1;
        if state.sample_count % CLEAN_UP_EVERY_N_SAMPLES == 0 {
            self.remove_context_for_dead_threads(state);
        }

        let current_cpu_time_ns =
            context_for(&mut state.contexts, runtime, current_thread).cpu_time_now_ns(runtime);
        let current_wall_time_ns = runtime
            .monotonic_wall_time_ns()
            .ok_or_else(|| Error::Clock("Failed to read monotonic clock".to_string()))?;

        self.update_metrics_and_sample(
            state,
            current_thread,
            stack_from_thread,
            current_cpu_time_ns,
            current_wall_time_ns,
        )
    }

    fn update_metrics_and_sample(
        &self,
        state: &mut CollectorState,
        thread_being_sampled: ThreadRef,
        stack_from_thread: ThreadRef,
        current_cpu_time_ns: i64,
        current_monotonic_wall_time_ns: i64,
    ) -> Result<()> {
        let CollectorState {
            contexts,
            buffer,
            time_converter,
            ..
        } = state;
        let context = context_for(contexts, self.runtime.as_ref(), thread_being_sampled);

        let cpu_time_elapsed_ns = update_time_since_previous_sample(
            &mut context.cpu_time_at_previous_sample_ns,
            current_cpu_time_ns,
            context.gc_tracking.cpu_time_at_start_ns,
            TimeKind::Cpu,
        )?;
        let wall_time_elapsed_ns = update_time_since_previous_sample(
            &mut context.wall_time_at_previous_sample_ns,
            current_monotonic_wall_time_ns,
            context.gc_tracking.wall_time_at_start_ns,
            TimeKind::Wall,
        )?;

        self.trigger_sample_for_thread(
            buffer,
            time_converter,
            context,
            ThreadSample {
                thread: thread_being_sampled,
                stack_from_thread,
                values: SampleValues {
                    cpu_time_ns: cpu_time_elapsed_ns,
                    cpu_or_wall_samples: 1,
                    wall_time_ns: wall_time_elapsed_ns,
                    alloc_samples: 0,
                },
                sample_type: SampleType::Regular,
                current_monotonic_wall_time_ns: Some(current_monotonic_wall_time_ns),
                ruby_vm_type: None,
                class_name: None,
            },
        )
    }

    fn trigger_sample_for_thread(
        &self,
        buffer: &mut SamplingBuffer,
        time_converter: &mut MonotonicToEpoch,
        context: &PerThreadContext,
        sample: ThreadSample<'_>,
    ) -> Result<()> {
        let runtime = self.runtime.as_ref();
        let mut sample_labels = Vec::with_capacity(labels::MAX_LABEL_COUNT);

        sample_labels.push(Label::str(labels::THREAD_ID, context.thread_id.as_str()));

        let thread_name = match runtime.thread_name(sample.thread) {
            Some(name) => name,
            None if sample.thread == self.main_thread => labels::MAIN_THREAD_NAME.to_string(),
            // Empty when the thread has no invoke location either
            None => context.thread_invoke_location.clone(),
        };
        sample_labels.push(Label::str(labels::THREAD_NAME, thread_name));

        if let Some(trace) = self.trace_identifiers_for(sample.thread) {
            sample_labels.push(Label::num(labels::LOCAL_ROOT_SPAN_ID, trace.local_root_span_id));
            sample_labels.push(Label::num(labels::SPAN_ID, trace.span_id));

            // The endpoint can change during a trace; the recorder applies the latest one at
            // serialization time
            if let Some(endpoint) = trace.endpoint {
                self.recorder
                    .record_endpoint(trace.local_root_span_id, &endpoint)?;
            }
        }

        if sample.thread != sample.stack_from_thread {
            sample_labels.push(Label::num(labels::PROFILER_OVERHEAD, 1));
        }

        if let Some(ruby_vm_type) = sample.ruby_vm_type {
            sample_labels.push(Label::str(labels::RUBY_VM_TYPE, ruby_vm_type));
        }

        if let Some(class_name) = sample.class_name {
            sample_labels.push(Label::str(labels::ALLOCATION_CLASS, class_name));
        }

        let state_label = (sample.values.cpu_or_wall_samples > 0).then(|| {
            sample_labels.push(Label::str(labels::STATE, stack::state::UNKNOWN));
            sample_labels.len() - 1
        });

        let end_timestamp_ns = match sample.current_monotonic_wall_time_ns {
            Some(monotonic_ns) if self.config.timeline_enabled => {
                time_converter.convert(monotonic_ns, || {
                    Some((runtime.system_epoch_time_ns()?, runtime.monotonic_wall_time_ns()?))
                })
            }
            _ => None,
        };

        stack::sample_thread(
            runtime,
            sample.stack_from_thread,
            buffer,
            &self.recorder,
            sample.values,
            SampleLabels {
                labels: sample_labels,
                state_label,
                end_timestamp_ns,
            },
            sample.sample_type,
        )
    }

    fn trace_identifiers_for(&self, thread: ThreadRef) -> Option<TraceIdentifiers> {
        let trace = self.runtime.trace_context(thread)?;
        let local_root_span_id = trace.local_root_span_id?;
        let span_id = trace.span_id?;

        let collect_endpoint = self.config.endpoint_collection_enabled
            && trace
                .root_span_type
                .as_deref()
                .is_some_and(labels::should_collect_resource);
        let endpoint = if collect_endpoint {
            trace.trace_resource.or(trace.root_span_resource)
        } else {
            None
        };

        Some(TraceIdentifiers {
            local_root_span_id,
            span_id,
            endpoint,
        })
    }

    fn remove_context_for_dead_threads(&self, state: &mut CollectorState) {
        let before = state.contexts.len();
        state
            .contexts
            .retain(|thread, _| self.runtime.is_thread_alive(*thread));

        let removed = before - state.contexts.len();
        if removed > 0 {
            debug!(removed, "Removed contexts of dead threads");
        }
    }

    /// Record GC start for the current thread. Never allocates.
    pub fn on_gc_start(&self) {
        let Some(mut state) = self.state.try_lock() else {
            self.stats.gc_events_during_sample.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let runtime = self.runtime.as_ref();
        // Contexts are only created when sampling; a thread never sampled before its first GC is
        // rare enough to just count
        let Some(context) = state.contexts.get_mut(&runtime.current_thread()) else {
            self.stats
                .gc_samples_missed_due_to_missing_context
                .fetch_add(1, Ordering::Relaxed);
            return;
        };

        // A previous GC is still waiting for sample_after_gc: extend it instead
        if context.gc_tracking.cpu_time_at_finish_ns.is_some()
            && context.gc_tracking.wall_time_at_finish_ns.is_some()
        {
            return;
        }

        // Wall time first here and last in on_gc_finish, so wall time never ends up below cpu time
        context.gc_tracking.wall_time_at_start_ns = runtime.monotonic_wall_time_ns();
        context.gc_tracking.cpu_time_at_start_ns = Some(context.cpu_time_now_ns(runtime));
    }

    /// Record GC finish for the current thread. Never allocates.
    pub fn on_gc_finish(&self) {
        let Some(mut state) = self.state.try_lock() else {
            self.stats.gc_events_during_sample.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let runtime = self.runtime.as_ref();
        let Some(context) = state.contexts.get_mut(&runtime.current_thread()) else {
            return;
        };
        if !context.gc_tracking.is_started() {
            return;
        }

        context.gc_tracking.cpu_time_at_finish_ns = Some(context.cpu_time_now_ns(runtime));
        context.gc_tracking.wall_time_at_finish_ns = runtime.monotonic_wall_time_ns();
    }

    /// Emit one "in GC" sample per thread with a completed GC period
    pub fn sample_after_gc(&self) -> Result<()> {
        let runtime = self.runtime.as_ref();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut threads = std::mem::take(&mut state.thread_list);
        threads.clear();
        runtime.thread_list(&mut threads);

        let result = self.sample_threads_after_gc(state, &threads);
        state.thread_list = threads;

        if result? {
            self.stats.gc_samples.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn sample_threads_after_gc(&self, state: &mut CollectorState, threads: &[ThreadRef]) -> Result<bool> {
        let CollectorState {
            contexts,
            buffer,
            time_converter,
            ..
        } = state;
        let mut sampled_any_thread = false;

        for &thread in threads {
            let context = context_for(contexts, self.runtime.as_ref(), thread);
            let tracking = &context.gc_tracking;
            if !tracking.is_started() || !tracking.is_finished() {
                continue;
            }

            let wall_time_at_start_ns = tracking.wall_time_at_start_ns.unwrap_or(0);
            let wall_time_at_finish_ns = tracking.wall_time_at_finish_ns.unwrap_or(0);

            let gc_cpu_time_elapsed_ns = tracking.cpu_time_at_finish_ns.unwrap_or(0)
                - tracking.cpu_time_at_start_ns.unwrap_or(0);
            let gc_wall_time_elapsed_ns = (wall_time_at_finish_ns - wall_time_at_start_ns).max(0);

            if gc_cpu_time_elapsed_ns < 0 {
                return Err(Error::bug(
                    "Unexpected negative gc_cpu_time_elapsed_ns between samples",
                ));
            }
            if wall_time_at_start_ns == 0 && wall_time_at_finish_ns != 0 {
                return Err(Error::bug(
                    "Unexpected zero value for gc_tracking.wall_time_at_start_ns",
                ));
            }

            self.trigger_sample_for_thread(
                buffer,
                time_converter,
                context,
                ThreadSample {
                    thread,
                    stack_from_thread: thread,
                    values: SampleValues {
                        cpu_time_ns: gc_cpu_time_elapsed_ns,
                        cpu_or_wall_samples: 1,
                        wall_time_ns: gc_wall_time_elapsed_ns,
                        alloc_samples: 0,
                    },
                    sample_type: SampleType::InGc,
                    current_monotonic_wall_time_ns: None,
                    ruby_vm_type: None,
                    class_name: None,
                },
            )?;

            context.gc_tracking.clear();

            // Keep the next regular sample from charging the GC period again
            if let Some(previous) = context.cpu_time_at_previous_sample_ns.as_mut() {
                *previous += gc_cpu_time_elapsed_ns;
            }
            if let Some(previous) = context.wall_time_at_previous_sample_ns.as_mut() {
                *previous += gc_wall_time_elapsed_ns;
            }

            sampled_any_thread = true;
        }

        Ok(sampled_any_thread)
    }

    /// Record an allocation of `object` on the current thread, weighted by `sample_weight`
    pub fn sample_allocation(&self, sample_weight: u32, object: &AllocatedObject) -> Result<()> {
        let runtime = self.runtime.as_ref();
        let class_name = self
            .config
            .allocation_type_enabled
            .then(|| labels::allocation_class_name(object));

        let mut guard = self.state.lock();
        let CollectorState {
            contexts,
            buffer,
            time_converter,
            ..
        } = &mut *guard;

        let current_thread = runtime.current_thread();
        let context = context_for(contexts, runtime, current_thread);

        self.trigger_sample_for_thread(
            buffer,
            time_converter,
            context,
            ThreadSample {
                thread: current_thread,
                stack_from_thread: current_thread,
                values: SampleValues {
                    alloc_samples: i64::from(sample_weight),
                    ..Default::default()
                },
                sample_type: SampleType::Regular,
                // No timestamps for allocation samples
                current_monotonic_wall_time_ns: None,
                ruby_vm_type: Some(object.vm_type.as_str()),
                class_name,
            },
        )
    }

    /// Copy of every per-thread context
    pub fn per_thread_context(&self) -> HashMap<ThreadRef, PerThreadContext> {
        self.state.lock().contexts.clone()
    }

    pub fn stats(&self) -> ThreadContextStats {
        ThreadContextStats {
            gc_samples: self.stats.gc_samples.load(Ordering::Relaxed),
            gc_samples_missed_due_to_missing_context: self
                .stats
                .gc_samples_missed_due_to_missing_context
                .load(Ordering::Relaxed),
            gc_events_during_sample: self.stats.gc_events_during_sample.load(Ordering::Relaxed),
        }
    }

    pub fn sample_count(&self) -> u64 {
        self.state.lock().sample_count
    }

    /// Human-readable dump of the collector state
    pub fn inspect(&self) -> String {
        let state = self.state.lock();
        let mut result = String::from(" (native state)");

        let _ = write!(result, " max_frames={}", state.buffer.max_frames());
        let _ = write!(result, " contexts={}", state.contexts.len());
        let _ = write!(result, " sample_count={}", state.sample_count);
        let _ = write!(result, " stats={:?}", self.stats());
        let _ = write!(result, " endpoint_collection_enabled={}", self.config.endpoint_collection_enabled);
        let _ = write!(result, " timeline_enabled={}", self.config.timeline_enabled);
        let _ = write!(result, " allocation_type_enabled={}", self.config.allocation_type_enabled);
        let _ = write!(
            result,
            " time_converter_state={{.system_epoch_ns_reference={:?}, .delta_to_epoch_ns={:?}}}",
            state.time_converter.system_epoch_ns_reference,
            state.time_converter.delta_to_epoch_ns
        );
        result
    }

    /// Forget all threads and counters, and reset the recorder. Call in a forked child before
    /// sampling resumes.
    pub fn reset_after_fork(&self) {
        {
            let mut state = self.state.lock();
            state.contexts.clear();
            state.thread_list.clear();
        }
        self.stats.gc_samples.store(0, Ordering::Relaxed);
        self.stats
            .gc_samples_missed_due_to_missing_context
            .store(0, Ordering::Relaxed);
        self.stats.gc_events_during_sample.store(0, Ordering::Relaxed);

        self.recorder.reset_after_fork();
        debug!("Thread context collector reset after fork");
    }
}

impl std::fmt::Debug for ThreadContextCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContextCollector")
            .field("config", &self.config)
            .field("main_thread", &self.main_thread)
            .field("stats", &self.stats())
            .finish()
    }
}

fn context_for<'a>(
    contexts: &'a mut HashMap<ThreadRef, PerThreadContext>,
    runtime: &dyn HostRuntime,
    thread: ThreadRef,
) -> &'a mut PerThreadContext {
    contexts
        .entry(thread)
        .or_insert_with(|| PerThreadContext::new(runtime, thread))
}
