/*!
# Profiler Configuration

Settings for the three configurable components of the profiler core.

## Components

### Worker
- GC profiling on/off
- Allocation counting on/off, and how often allocations are sampled
- The "no signals" workaround for hosts where targeted signal delivery is unreliable
- Dynamic sampling rate on/off

### Thread Context
- Maximum captured stack depth
- Endpoint collection, timeline timestamps and allocation class labels

### Recorder
- Which optional value types (cpu-time, alloc-samples) get recorded

Every struct validates itself; [`ProfilerConfig::validate`] checks all of them. Invalid values are
configuration errors raised at construction time.
*/

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Smallest supported stack capture depth
pub const MIN_FRAMES: u32 = 5;
/// Largest supported stack capture depth
pub const MAX_FRAMES_LIMIT: u32 = 10_000;
/// Stack depth captured when not configured
pub const DEFAULT_MAX_FRAMES: u32 = 400;

/// Complete profiler configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub worker: WorkerConfig,
    pub thread_context: ThreadContextConfig,
    pub recorder: RecorderConfig,
}

impl ProfilerConfig {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ProfilerConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        self.thread_context.validate()?;
        Ok(())
    }
}

/// Sampling worker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Attribute time spent in GC to its own samples
    pub gc_profiling_enabled: bool,
    /// Enable the allocation tracepoint
    pub allocation_counting_enabled: bool,
    /// Never send signals; grab the global lock from the trigger thread instead
    pub no_signals_workaround_enabled: bool,
    /// Throttle sampling to keep overhead near the target percentage
    pub dynamic_sampling_rate_enabled: bool,
    /// Sample every Nth allocation (0 disables allocation sampling)
    pub allocation_sample_every: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            gc_profiling_enabled: true,
            allocation_counting_enabled: false,
            no_signals_workaround_enabled: false,
            dynamic_sampling_rate_enabled: true,
            allocation_sample_every: 0,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.allocation_sample_every < 0 {
            return Err(Error::Config(format!(
                "Unexpected value for allocation_sample_every: {}. This value must be >= 0.",
                self.allocation_sample_every
            )));
        }
        Ok(())
    }
}

/// Thread context collector settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadContextConfig {
    pub max_frames: u32,
    pub endpoint_collection_enabled: bool,
    pub timeline_enabled: bool,
    pub allocation_type_enabled: bool,
}

impl Default for ThreadContextConfig {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            endpoint_collection_enabled: true,
            timeline_enabled: false,
            allocation_type_enabled: true,
        }
    }
}

impl ThreadContextConfig {
    pub fn validate(&self) -> Result<()> {
        validate_max_frames(self.max_frames)
    }
}

/// Stack recorder settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub cpu_time_enabled: bool,
    pub alloc_samples_enabled: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            cpu_time_enabled: true,
            alloc_samples_enabled: true,
        }
    }
}

pub fn validate_max_frames(max_frames: u32) -> Result<()> {
    if max_frames < MIN_FRAMES {
        return Err(Error::Config(format!(
            "Invalid max_frames: value must be >= {}",
            MIN_FRAMES
        )));
    }
    if max_frames > MAX_FRAMES_LIMIT {
        return Err(Error::Config(format!(
            "Invalid max_frames: value must be <= {}",
            MAX_FRAMES_LIMIT
        )));
    }
    Ok(())
}
