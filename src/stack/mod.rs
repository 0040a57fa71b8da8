/*!
# Stack Sampler

Captures one thread's stack into pre-allocated scratch buffers, resolves it into locations and
hands the result to the [`StackRecorder`].

## Frames

The runtime fills four parallel arrays sized to `max_frames`: raw frames, line numbers, and a
managed/native flag per slot, with resolved locations written into the fourth. Native frames carry no
file or line of their own; they inherit both from the nearest managed frame below them, the same way
the runtime's own backtrace API reports them.

## Placeholders

- A thread whose stack cannot be walked gets a single `In native code` frame
- A stack that fills the buffer gets its last slot replaced with `N frames omitted`
- GC samples get a `Garbage Collection` top frame; the walk itself uses a view of the buffer shifted
  by one slot, so it never has to know about the extra frame

## State label

Samples carrying CPU or wall time must bring a `state` label. It is set to `had cpu` when the thread
consumed CPU, or classified from the top frame when only wall time elapsed (see [`state`]).
*/

pub mod state;

use std::fmt::Write as _;
use std::sync::Arc;

use crate::config::validate_max_frames;
use crate::recorder::{Label, LabelValue, Location, SampleValues, StackRecorder};
use crate::runtime::{FrameCapture, FrameSlots, HostRuntime, RawFrame, ThreadRef};
use crate::{Error, Result};

pub const IN_NATIVE_CODE: &str = "In native code";
pub const GARBAGE_COLLECTION: &str = "Garbage Collection";

/// Kind of stack being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Regular,
    /// Prepend a synthetic "Garbage Collection" frame
    InGc,
}

/// Labels of one sample plus the slot reserved for the state classification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleLabels {
    pub labels: Vec<Label>,
    /// Index into `labels` of the `state` label, if any
    pub state_label: Option<usize>,
    pub end_timestamp_ns: Option<i64>,
}

impl SampleLabels {
    pub fn state(&self) -> Option<&str> {
        self.state_label
            .and_then(|index| self.labels.get(index))
            .and_then(Label::as_str)
    }

    fn set_state(&mut self, state: &'static str) {
        if let Some(label) = self.state_label.and_then(|index| self.labels.get_mut(index)) {
            label.value = LabelValue::Str(state.to_string());
        }
    }
}

/// Scratch space reused across samples
pub struct SamplingBuffer {
    max_frames: usize,
    frames: Vec<RawFrame>,
    lines: Vec<i64>,
    is_managed: Vec<bool>,
    locations: Vec<Location>,
}

impl SamplingBuffer {
    pub fn new(max_frames: u32) -> Result<Self> {
        validate_max_frames(max_frames)?;
        let max_frames = max_frames as usize;

        Ok(Self {
            max_frames,
            frames: vec![RawFrame::default(); max_frames],
            lines: vec![0; max_frames],
            is_managed: vec![false; max_frames],
            locations: vec![Location::default(); max_frames],
        })
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }
}

impl std::fmt::Debug for SamplingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplingBuffer")
            .field("max_frames", &self.max_frames)
            .finish()
    }
}

/// Capture `thread`'s stack and record it with `values` and `labels`
pub fn sample_thread(
    runtime: &dyn HostRuntime,
    thread: ThreadRef,
    buffer: &mut SamplingBuffer,
    recorder: &StackRecorder,
    values: SampleValues,
    labels: SampleLabels,
    sample_type: SampleType,
) -> Result<()> {
    match sample_type {
        SampleType::Regular => {
            sample_thread_internal(runtime, thread, buffer, 0, recorder, values, labels)
        }
        SampleType::InGc => {
            set_location(&mut buffer.locations[0], "", GARBAGE_COLLECTION, 0);
            sample_thread_internal(runtime, thread, buffer, 1, recorder, values, labels)
        }
    }
}

/// Walk into the view of `buffer` starting at `offset`; the first `offset` locations were already
/// filled by the caller and are recorded ahead of the walked frames.
fn sample_thread_internal(
    runtime: &dyn HostRuntime,
    thread: ThreadRef,
    buffer: &mut SamplingBuffer,
    offset: usize,
    recorder: &StackRecorder,
    values: SampleValues,
    mut labels: SampleLabels,
) -> Result<()> {
    let SamplingBuffer {
        max_frames,
        frames,
        lines,
        is_managed,
        locations,
    } = buffer;
    let max_frames = *max_frames - offset;

    let capture = runtime.capture_frames(
        thread,
        FrameSlots {
            frames: &mut frames[offset..],
            lines: &mut lines[offset..],
            is_managed: &mut is_managed[offset..],
        },
    );

    let captured_frames = match capture {
        FrameCapture::InNativeCode => {
            set_location(&mut locations[offset], "", IN_NATIVE_CODE, 0);
            return record(recorder, &locations[..offset + 1], values, &labels);
        }
        FrameCapture::Captured(captured) => captured.min(max_frames),
    };

    let cpu_or_wall_sample = values.cpu_or_wall_samples > 0;
    let has_cpu_time = cpu_or_wall_sample && values.cpu_time_ns > 0;
    let only_wall_time = cpu_or_wall_sample && values.cpu_time_ns == 0 && values.wall_time_ns > 0;

    if cpu_or_wall_sample && labels.state_label.is_none() {
        return Err(Error::bug("Unexpected missing state_label"));
    }
    if has_cpu_time {
        labels.set_state(state::HAD_CPU);
    }

    let mut last_managed_path: Option<Arc<str>> = None;
    let mut last_managed_line = 0;

    for i in (0..captured_frames).rev() {
        let frame = &frames[offset + i];
        let managed = is_managed[offset + i];

        let (path, line) = if managed {
            last_managed_path = frame.path.clone();
            last_managed_line = lines[offset + i];
            (frame.path.as_deref(), last_managed_line)
        } else {
            (last_managed_path.as_deref(), last_managed_line)
        };

        let name = frame.name.as_deref().unwrap_or("");
        let file = path.unwrap_or("");

        if i == 0 && only_wall_time {
            if let Some(thread_state) = state::classify_top_frame(name, file, managed) {
                labels.set_state(thread_state);
            }
        }

        set_location(&mut locations[offset + i], name, file, line);
    }

    if captured_frames == max_frames {
        let depth = runtime.stack_depth(thread);
        if depth > max_frames {
            // The placeholder takes over a slot, so that frame is omitted too
            let frames_omitted = depth - max_frames + 1;
            let placeholder = &mut locations[offset + max_frames - 1];
            placeholder.name.clear();
            placeholder.file.clear();
            let _ = write!(placeholder.file, "{} frames omitted", frames_omitted);
            placeholder.line = 0;
        }
    }

    record(
        recorder,
        &locations[..offset + captured_frames],
        values,
        &labels,
    )
}

fn record(
    recorder: &StackRecorder,
    locations: &[Location],
    values: SampleValues,
    labels: &SampleLabels,
) -> Result<()> {
    recorder.record_sample(locations, values, &labels.labels, labels.end_timestamp_ns)?;
    Ok(())
}

fn set_location(location: &mut Location, name: &str, file: &str, line: i64) {
    location.name.clear();
    location.name.push_str(name);
    location.file.clear();
    location.file.push_str(file);
    location.line = line;
}
