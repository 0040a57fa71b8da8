use serde::{Deserialize, Serialize};

use crate::runtime::{CpuClockId, HostRuntime, ThreadRef};
use crate::{Error, Result};

const THREAD_INVOKE_LOCATION_LIMIT_CHARS: usize = 512;
const LOGGING_GEM_PATH: &str = "/lib/logging/diagnostic_context.rb";

pub const UNNAMED_THREAD: &str = "(Unnamed thread)";
pub const UNNAMED_NATIVE_THREAD: &str = "(Unnamed thread from native code)";

/// Timestamps recorded by the GC hooks, pending `sample_after_gc`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcTracking {
    pub cpu_time_at_start_ns: Option<i64>,
    pub cpu_time_at_finish_ns: Option<i64>,
    pub wall_time_at_start_ns: Option<i64>,
    pub wall_time_at_finish_ns: Option<i64>,
}

impl GcTracking {
    pub fn is_started(&self) -> bool {
        self.cpu_time_at_start_ns.is_some() || self.wall_time_at_start_ns.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.cpu_time_at_finish_ns.is_some() || self.wall_time_at_finish_ns.is_some()
    }

    pub fn clear(&mut self) {
        *self = GcTracking::default();
    }
}

/// Sampling state kept for one application thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerThreadContext {
    /// `"{native id} ({object id})"`
    pub thread_id: String,
    pub thread_invoke_location: String,
    pub cpu_clock: Option<CpuClockId>,
    pub cpu_time_at_previous_sample_ns: Option<i64>,
    pub wall_time_at_previous_sample_ns: Option<i64>,
    pub gc_tracking: GcTracking,
}

impl PerThreadContext {
    pub fn new(runtime: &dyn HostRuntime, thread: ThreadRef) -> Self {
        let thread_id = format!("{} ({})", runtime.native_thread_id(thread), thread);

        let thread_invoke_location = match runtime.invoke_location(thread) {
            Some(location) if location.file.ends_with(LOGGING_GEM_PATH) => {
                UNNAMED_THREAD.to_string()
            }
            Some(location) => {
                let mut formatted = format!("{}:{}", location.file, location.line);
                truncate_on_char_boundary(&mut formatted, THREAD_INVOKE_LOCATION_LIMIT_CHARS - 1);
                formatted
            }
            None if thread != runtime.main_thread() => UNNAMED_NATIVE_THREAD.to_string(),
            None => String::new(),
        };

        Self {
            thread_id,
            thread_invoke_location,
            cpu_clock: runtime.cpu_clock_for(thread),
            cpu_time_at_previous_sample_ns: None,
            wall_time_at_previous_sample_ns: None,
            gc_tracking: GcTracking::default(),
        }
    }

    /// Current CPU time of this thread, or 0 when its clock is unavailable.
    ///
    /// A failed read also forgets the previous sample time, so the next successful read starts over
    /// instead of reporting a bogus delta.
    pub fn cpu_time_now_ns(&mut self, runtime: &dyn HostRuntime) -> i64 {
        let Some(clock) = self.cpu_clock else {
            return 0;
        };

        match runtime.read_cpu_clock(clock) {
            Some(cpu_time_ns) => cpu_time_ns,
            None => {
                self.cpu_time_at_previous_sample_ns = None;
                0
            }
        }
    }
}

/// Which clock a delta is being computed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKind {
    Cpu,
    Wall,
}

/// Time to attribute to the current sample, advancing `time_at_previous_sample_ns`.
///
/// While GC is in progress only the time up to GC start is attributed and the previous-sample time
/// is pinned there; the GC period itself is reported later by `sample_after_gc`.
pub fn update_time_since_previous_sample(
    time_at_previous_sample_ns: &mut Option<i64>,
    current_time_ns: i64,
    gc_start_time_ns: Option<i64>,
    kind: TimeKind,
) -> Result<i64> {
    let previous = *time_at_previous_sample_ns.get_or_insert(current_time_ns);

    let elapsed_time_ns = match gc_start_time_ns {
        Some(gc_start_time_ns) => {
            *time_at_previous_sample_ns = Some(gc_start_time_ns);
            if gc_start_time_ns <= previous {
                0
            } else {
                gc_start_time_ns - previous
            }
        }
        None => {
            *time_at_previous_sample_ns = Some(current_time_ns);
            current_time_ns - previous
        }
    };

    if elapsed_time_ns < 0 {
        return match kind {
            // System clock adjustments can move wall time backwards
            TimeKind::Wall => Ok(0),
            TimeKind::Cpu => Err(Error::bug(
                "Unexpected negative elapsed_time_ns between samples",
            )),
        };
    }

    Ok(elapsed_time_ns)
}

fn truncate_on_char_boundary(value: &mut String, max_len: usize) {
    if value.len() <= max_len {
        return;
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
}
