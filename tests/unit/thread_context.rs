use std::sync::Arc;

use cpu_wall_profiler::config::ThreadContextConfig;
use cpu_wall_profiler::recorder::{Location, ProfileSnapshot, SerializedSample};
use cpu_wall_profiler::runtime::{
    clock, AllocatedObject, HostRuntime, InvokeLocation, ThreadRef, TraceContext, VmValueType,
};
use cpu_wall_profiler::Error;
use pretty_assertions::assert_eq;

use crate::common::{
    collector, label_num, label_str, managed_stack, recorder, samples_with_top_frame, snapshot,
    value, FakeRuntime, FakeThread, MAIN_THREAD,
};

const WORKER: ThreadRef = ThreadRef(2);

fn find<'a>(snapshot: &'a ProfileSnapshot, thread_id: &str) -> Vec<&'a SerializedSample> {
    snapshot
        .samples
        .iter()
        .filter(|sample| label_str(sample, "thread id") == Some(thread_id))
        .collect()
}

/// The sample of `thread_id` that was charged CPU time
fn with_cpu<'a>(snapshot: &'a ProfileSnapshot, thread_id: &str) -> &'a SerializedSample {
    let matching: Vec<_> = find(snapshot, thread_id)
        .into_iter()
        .filter(|sample| label_str(sample, "state") == Some("had cpu"))
        .collect();
    assert_eq!(matching.len(), 1);
    matching[0]
}

fn now(runtime: &FakeRuntime) -> i64 {
    runtime.monotonic_wall_time_ns().unwrap()
}

#[test]
fn test_thread_labels() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_thread(WORKER, FakeThread::new(4242).named("worker-1"));
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let worker = find(&snapshot, "4242 (2)");
    assert_eq!(worker.len(), 1);
    assert_eq!(label_str(worker[0], "thread name"), Some("worker-1"));
    assert_eq!(label_num(worker[0], "profiler overhead"), None);

    let main = find(&snapshot, "100 (1)");
    assert_eq!(main.len(), 1);
    assert_eq!(label_str(main[0], "thread name"), Some("main"));
}

#[test]
fn test_profiler_overhead_uses_other_threads_stack() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_thread(WORKER, FakeThread::new(7).with_frames(managed_stack(&["busy", "<main>"])));
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), WORKER).unwrap();

    let snapshot = snapshot(&recorder);
    let overhead: Vec<_> = snapshot
        .samples
        .iter()
        .filter(|sample| label_num(sample, "profiler overhead") == Some(1))
        .collect();
    assert_eq!(overhead.len(), 1);
    assert_eq!(label_str(overhead[0], "thread id"), Some("100 (1)"));
    assert_eq!(overhead[0].locations[0], Location::new("busy", "app.rb", 10));
}

#[test]
fn test_cpu_and_wall_time_between_samples() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_thread(WORKER, FakeThread::new(7));
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();
    snapshot(&recorder);

    runtime.set_cpu_time(WORKER, 5_000_000);
    runtime.advance_wall_time(10_000_000);
    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let worker = find(&snapshot, "7 (2)");
    assert_eq!(worker.len(), 1);
    assert_eq!(value(&snapshot, worker[0], "cpu-time"), 5_000_000);
    assert_eq!(value(&snapshot, worker[0], "wall-time"), 10_000_000);
    assert_eq!(value(&snapshot, worker[0], "cpu-samples"), 1);
    assert_eq!(label_str(worker[0], "state"), Some("had cpu"));
}

#[test]
fn test_first_sample_of_a_thread_attributes_no_time() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_thread(WORKER, FakeThread::new(7));
    runtime.set_cpu_time(WORKER, 123_456);
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let worker = find(&snapshot, "7 (2)");
    assert_eq!(value(&snapshot, worker[0], "cpu-time"), 0);
    assert_eq!(value(&snapshot, worker[0], "wall-time"), 0);
    assert_eq!(label_str(worker[0], "state"), Some("unknown"));
}

#[test]
fn test_missing_cpu_clock_reports_wall_time_only() {
    let runtime = Arc::new(FakeRuntime::new());
    let mut thread = FakeThread::new(7);
    thread.has_cpu_clock = false;
    thread.cpu_time_ns = 1_000_000;
    runtime.add_thread(WORKER, thread);
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();
    snapshot(&recorder);
    runtime.set_cpu_time(WORKER, 9_000_000);
    runtime.advance_wall_time(1_000_000);
    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let worker = find(&snapshot, "7 (2)");
    assert_eq!(value(&snapshot, worker[0], "cpu-time"), 0);
    assert_eq!(value(&snapshot, worker[0], "wall-time"), 1_000_000);
    assert_eq!(
        collector.per_thread_context()[&WORKER].cpu_clock,
        None
    );
}

#[test]
fn test_negative_cpu_time_is_reported_as_bug() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.set_cpu_time(MAIN_THREAD, 1_000);
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();
    runtime.set_cpu_time(MAIN_THREAD, 500);
    let err = collector.sample(now(&runtime), MAIN_THREAD).unwrap_err();

    assert!(matches!(err, Error::Invariant(_)));
    assert_eq!(err.to_string(), "BUG: Unexpected negative elapsed_time_ns between samples");
}

#[test]
fn test_thread_name_falls_back_to_invoke_location() {
    let runtime = Arc::new(FakeRuntime::new());

    let mut logging = FakeThread::new(2);
    logging.invoke_location = Some(InvokeLocation {
        file: "/gems/logging-2.3.1/lib/logging/diagnostic_context.rb".to_string(),
        line: 474,
    });
    runtime.add_thread(ThreadRef(2), logging);

    let mut regular = FakeThread::new(3);
    regular.invoke_location = Some(InvokeLocation {
        file: "worker.rb".to_string(),
        line: 7,
    });
    runtime.add_thread(ThreadRef(3), regular);

    runtime.add_thread(ThreadRef(4), FakeThread::new(4));

    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());
    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let name_of = |thread_id: &str| label_str(find(&snapshot, thread_id)[0], "thread name").map(str::to_string);
    assert_eq!(name_of("2 (2)").as_deref(), Some("(Unnamed thread)"));
    assert_eq!(name_of("3 (3)").as_deref(), Some("worker.rb:7"));
    assert_eq!(name_of("4 (4)").as_deref(), Some("(Unnamed thread from native code)"));
    assert_eq!(name_of("100 (1)").as_deref(), Some("main"));
}

#[test]
fn test_dead_threads_are_swept_periodically() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_thread(WORKER, FakeThread::new(7));
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();
    runtime.update_thread(WORKER, |thread| thread.alive = false);

    for _ in 1..99 {
        collector.sample(now(&runtime), MAIN_THREAD).unwrap();
    }
    assert_eq!(collector.sample_count(), 99);
    assert!(collector.per_thread_context().contains_key(&WORKER));

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();
    let contexts = collector.per_thread_context();
    assert!(!contexts.contains_key(&WORKER));
    assert!(contexts.contains_key(&MAIN_THREAD));
}

#[test]
fn test_gc_cycles_before_sample_after_gc_are_coalesced() {
    let runtime = Arc::new(FakeRuntime::new());
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();
    snapshot(&recorder);

    for (wall_time_ns, cpu_time_ns, gc_start) in [
        (2_000_000_000, 100, true),
        (3_000_000_000, 150, false),
        (4_000_000_000, 200, true),
        (5_000_000_000, 260, false),
    ] {
        runtime.set_wall_time(wall_time_ns);
        runtime.set_cpu_time(MAIN_THREAD, cpu_time_ns);
        if gc_start {
            collector.on_gc_start();
        } else {
            collector.on_gc_finish();
        }
    }

    collector.sample_after_gc().unwrap();
    assert_eq!(collector.stats().gc_samples, 1);
    assert_eq!(collector.per_thread_context()[&MAIN_THREAD].gc_tracking, Default::default());

    let gc_snapshot = snapshot(&recorder);
    let gc_samples: Vec<_> = samples_with_top_frame(&gc_snapshot, "")
        .filter(|sample| sample.locations[0].file == "Garbage Collection")
        .collect();
    assert_eq!(gc_samples.len(), 1);
    assert_eq!(value(&gc_snapshot, gc_samples[0], "cpu-time"), 160);
    assert_eq!(value(&gc_snapshot, gc_samples[0], "wall-time"), 3_000_000_000);
    assert_eq!(gc_samples[0].locations[1], Location::new("<main>", "app.rb", 10));

    // The GC period must not be charged again
    runtime.set_wall_time(6_000_000_000);
    runtime.set_cpu_time(MAIN_THREAD, 300);
    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let regular = snapshot(&recorder);
    let main = with_cpu(&regular, "100 (1)");
    assert_eq!(value(&regular, main, "cpu-time"), 140);
    assert_eq!(value(&regular, main, "wall-time"), 2_000_000_000);
}

#[test]
fn test_sample_during_gc_stops_at_gc_start() {
    let runtime = Arc::new(FakeRuntime::new());
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();
    snapshot(&recorder);

    runtime.set_wall_time(2_000_000_000);
    runtime.set_cpu_time(MAIN_THREAD, 100);
    collector.on_gc_start();

    runtime.set_wall_time(3_000_000_000);
    runtime.set_cpu_time(MAIN_THREAD, 400);
    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let main = with_cpu(&snapshot, "100 (1)");
    assert_eq!(value(&snapshot, main, "cpu-time"), 100);
    assert_eq!(value(&snapshot, main, "wall-time"), 1_000_000_000);
}

#[test]
fn test_gc_without_context_is_counted() {
    let runtime = Arc::new(FakeRuntime::new());
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.on_gc_start();
    collector.on_gc_finish();
    collector.sample_after_gc().unwrap();

    let stats = collector.stats();
    assert_eq!(stats.gc_samples_missed_due_to_missing_context, 1);
    assert_eq!(stats.gc_samples, 0);
}

#[test]
fn test_allocation_sample_labels() {
    let runtime = Arc::new(FakeRuntime::new());
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector
        .sample_allocation(50, &AllocatedObject::new(VmValueType::String, "String"))
        .unwrap();

    let snapshot = snapshot(&recorder);
    assert_eq!(snapshot.samples.len(), 1);
    let sample = &snapshot.samples[0];
    assert_eq!(value(&snapshot, sample, "alloc-samples"), 50);
    assert_eq!(value(&snapshot, sample, "cpu-samples"), 0);
    assert_eq!(label_str(sample, "ruby vm type"), Some("T_STRING"));
    assert_eq!(label_str(sample, "allocation class"), Some("String"));
    assert_eq!(label_str(sample, "state"), None);
    assert_eq!(sample.timestamp_ns, None);
}

#[test]
fn test_allocation_class_can_be_disabled() {
    let runtime = Arc::new(FakeRuntime::new());
    let recorder = recorder();
    let collector = collector(
        &runtime,
        &recorder,
        ThreadContextConfig {
            allocation_type_enabled: false,
            ..Default::default()
        },
    );

    collector
        .sample_allocation(1, &AllocatedObject::without_class(VmValueType::Imemo))
        .unwrap();

    let snapshot = snapshot(&recorder);
    let sample = &snapshot.samples[0];
    assert_eq!(label_str(sample, "ruby vm type"), Some("T_IMEMO"));
    assert_eq!(sample.label("allocation class"), None);
}

#[test]
fn test_timeline_samples_carry_epoch_timestamps() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_thread(WORKER, FakeThread::new(7));
    let recorder = recorder();
    let collector = collector(
        &runtime,
        &recorder,
        ThreadContextConfig {
            timeline_enabled: true,
            ..Default::default()
        },
    );

    let before = clock::system_epoch_now_ns().unwrap();
    collector.sample(now(&runtime), MAIN_THREAD).unwrap();
    let after = clock::system_epoch_now_ns().unwrap();

    let snapshot = snapshot(&recorder);
    assert_eq!(snapshot.samples.len(), 3);
    for sample in &snapshot.samples {
        let timestamp_ns = sample.timestamp_ns.expect("timeline timestamp");
        assert!(timestamp_ns >= before && timestamp_ns <= after, "{}", timestamp_ns);
    }
}

#[test]
fn test_timeline_disabled_has_no_timestamps() {
    let runtime = Arc::new(FakeRuntime::new());
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    assert!(snapshot.samples.iter().all(|sample| sample.timestamp_ns.is_none()));
}

fn traced(root_span_type: &str, trace_resource: Option<&str>, root_span_resource: Option<&str>) -> TraceContext {
    TraceContext {
        local_root_span_id: Some(10),
        span_id: Some(11),
        root_span_type: Some(root_span_type.to_string()),
        trace_resource: trace_resource.map(str::to_string),
        root_span_resource: root_span_resource.map(str::to_string),
    }
}

fn endpoint_for(trace: TraceContext, endpoint_collection_enabled: bool) -> Option<String> {
    let runtime = Arc::new(FakeRuntime::new());
    let mut thread = FakeThread::new(7);
    thread.trace_context = Some(trace);
    runtime.add_thread(WORKER, thread);
    let recorder = recorder();
    let collector = collector(
        &runtime,
        &recorder,
        ThreadContextConfig {
            endpoint_collection_enabled,
            ..Default::default()
        },
    );

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let worker = find(&snapshot, "7 (2)");
    assert_eq!(label_num(worker[0], "local root span id"), Some(10));
    assert_eq!(label_num(worker[0], "span id"), Some(11));
    label_str(worker[0], "trace endpoint").map(str::to_string)
}

#[test]
fn test_endpoint_collection() {
    assert_eq!(
        endpoint_for(traced("web", Some("GET /users"), Some("ignored")), true).as_deref(),
        Some("GET /users")
    );
    assert_eq!(
        endpoint_for(traced("web", None, Some("POST /orders")), true).as_deref(),
        Some("POST /orders")
    );
    assert_eq!(endpoint_for(traced("worker", Some("job"), None), true), None);
    assert_eq!(endpoint_for(traced("web", Some("GET /users"), None), false), None);
}

#[test]
fn test_incomplete_trace_context_adds_no_span_labels() {
    let runtime = Arc::new(FakeRuntime::new());
    let mut thread = FakeThread::new(7);
    thread.trace_context = Some(TraceContext {
        local_root_span_id: Some(10),
        ..Default::default()
    });
    runtime.add_thread(WORKER, thread);
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let worker = find(&snapshot, "7 (2)");
    assert_eq!(worker[0].label("local root span id"), None);
    assert_eq!(worker[0].label("span id"), None);
}

#[test]
fn test_reset_after_fork_forgets_everything() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_thread(WORKER, FakeThread::new(7));
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();
    collector.on_gc_start();
    assert_eq!(collector.per_thread_context().len(), 2);

    collector.reset_after_fork();

    assert!(collector.per_thread_context().is_empty());
    assert_eq!(collector.stats(), Default::default());
    assert!(snapshot(&recorder).samples.is_empty());
    assert!(collector.inspect().contains("sample_count="));
    assert!(collector.inspect().contains("contexts=0"));
}
