use std::sync::Arc;

use cpu_wall_profiler::config::ThreadContextConfig;
use cpu_wall_profiler::recorder::{Location, SerializedSample};
use cpu_wall_profiler::runtime::{HostRuntime, RawFrame, ThreadRef};
use cpu_wall_profiler::Error;
use pretty_assertions::assert_eq;

use crate::common::{
    collector, deep_stack, label_str, managed_stack, recorder, snapshot, FakeRuntime, FakeThread,
    MAIN_THREAD,
};

const SAMPLED: ThreadRef = ThreadRef(2);

fn sample_of<'a>(samples: &'a [SerializedSample], thread_id: &str) -> &'a SerializedSample {
    samples
        .iter()
        .find(|sample| label_str(sample, "thread id") == Some(thread_id))
        .expect("sample for thread")
}

fn now(runtime: &FakeRuntime) -> i64 {
    runtime.monotonic_wall_time_ns().unwrap()
}

#[test]
fn test_deep_stack_is_truncated_with_placeholder() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_thread(SAMPLED, FakeThread::new(7).with_frames(deep_stack(10)));
    let recorder = recorder();
    let collector = collector(
        &runtime,
        &recorder,
        ThreadContextConfig {
            max_frames: 5,
            ..Default::default()
        },
    );

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let sample = sample_of(&snapshot.samples, "7 (2)");
    assert_eq!(
        sample.locations,
        vec![
            Location::new("method_0", "deep.rb", 1),
            Location::new("method_1", "deep.rb", 2),
            Location::new("method_2", "deep.rb", 3),
            Location::new("method_3", "deep.rb", 4),
            Location::new("", "6 frames omitted", 0),
        ]
    );
}

#[test]
fn test_stack_that_fits_exactly_is_complete() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_thread(SAMPLED, FakeThread::new(7).with_frames(deep_stack(5)));
    let recorder = recorder();
    let collector = collector(
        &runtime,
        &recorder,
        ThreadContextConfig {
            max_frames: 5,
            ..Default::default()
        },
    );

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let sample = sample_of(&snapshot.samples, "7 (2)");
    assert_eq!(sample.locations.len(), 5);
    assert_eq!(sample.locations[4], Location::new("method_4", "deep.rb", 5));
}

#[test]
fn test_native_frames_inherit_caller_location() {
    let runtime = Arc::new(FakeRuntime::new());
    let mut frames = vec![(RawFrame::native("each"), 0, false)];
    frames.extend(managed_stack(&["process", "<main>"]));
    runtime.add_thread(SAMPLED, FakeThread::new(7).with_frames(frames));
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let sample = sample_of(&snapshot.samples, "7 (2)");
    assert_eq!(
        sample.locations,
        vec![
            Location::new("each", "app.rb", 10),
            Location::new("process", "app.rb", 10),
            Location::new("<main>", "app.rb", 20),
        ]
    );
}

#[test]
fn test_thread_in_native_code_gets_placeholder() {
    let runtime = Arc::new(FakeRuntime::new());
    let mut thread = FakeThread::new(7);
    thread.in_native_code = true;
    runtime.add_thread(SAMPLED, thread);
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let sample = sample_of(&snapshot.samples, "7 (2)");
    assert_eq!(sample.locations, vec![Location::placeholder("In native code")]);
}

#[test]
fn test_wall_time_only_samples_are_classified() {
    let cases = [
        (RawFrame::native("sleep"), false, "sleeping"),
        (RawFrame::native("select"), false, "waiting"),
        (RawFrame::native("synchronize"), false, "blocked"),
        (RawFrame::native("join"), false, "blocked"),
        (RawFrame::native("wait_readable"), false, "network"),
        (RawFrame::new("pop", "<internal:thread_sync>"), true, "waiting"),
        (RawFrame::new("compute", "app.rb"), true, "unknown"),
    ];

    for (top, is_managed, expected_state) in cases {
        let runtime = Arc::new(FakeRuntime::new());
        let mut frames = vec![(top, 5, is_managed)];
        frames.extend(managed_stack(&["<main>"]));
        runtime.add_thread(SAMPLED, FakeThread::new(7).with_frames(frames));
        let recorder = recorder();
        let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

        collector.sample(now(&runtime), MAIN_THREAD).unwrap();
        snapshot(&recorder);

        runtime.advance_wall_time(1_000_000);
        collector.sample(now(&runtime), MAIN_THREAD).unwrap();

        let snapshot = snapshot(&recorder);
        let sample = sample_of(&snapshot.samples, "7 (2)");
        assert_eq!(label_str(sample, "state"), Some(expected_state), "{:?}", sample.locations[0]);
    }
}

#[test]
fn test_cpu_time_marks_had_cpu() {
    let runtime = Arc::new(FakeRuntime::new());
    let frames = vec![(RawFrame::native("sleep"), 0, false)];
    runtime.add_thread(SAMPLED, FakeThread::new(7).with_frames(frames));
    let recorder = recorder();
    let collector = collector(&runtime, &recorder, ThreadContextConfig::default());

    collector.sample(now(&runtime), MAIN_THREAD).unwrap();
    snapshot(&recorder);

    runtime.set_cpu_time(SAMPLED, 500);
    runtime.advance_wall_time(1_000);
    collector.sample(now(&runtime), MAIN_THREAD).unwrap();

    let snapshot = snapshot(&recorder);
    let sample = sample_of(&snapshot.samples, "7 (2)");
    assert_eq!(label_str(sample, "state"), Some("had cpu"));
}

#[test]
fn test_max_frames_bounds_are_config_errors() {
    let runtime = Arc::new(FakeRuntime::new());
    let recorder = recorder();
    let runtime: Arc<dyn HostRuntime> = runtime;

    for (max_frames, message) in [
        (4, "Configuration error: Invalid max_frames: value must be >= 5"),
        (10_001, "Configuration error: Invalid max_frames: value must be <= 10000"),
    ] {
        let err = cpu_wall_profiler::ThreadContextCollector::new(
            runtime.clone(),
            recorder.clone(),
            ThreadContextConfig {
                max_frames,
                ..Default::default()
            },
        )
        .unwrap_err();

        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), message);
    }
}
