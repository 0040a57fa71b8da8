//! Sampling profiler core for a managed runtime with a global interpreter lock.
//!
//! A background [`worker`] periodically interrupts whichever thread holds the lock. At the runtime's
//! next safe point the [`thread_context`] collector samples every thread's stack through [`stack`]
//! into the dual-slot [`recorder`], which a separate exporter thread serializes without ever
//! blocking the sampler.

pub mod config;
pub mod error;
pub mod idle_helper;
pub mod recorder;
pub mod runtime;
pub mod sampling_rate;
pub mod stack;
pub mod telemetry;
pub mod thread_context;
pub mod worker;

// Re-exports
pub use config::{ProfilerConfig, RecorderConfig, ThreadContextConfig, WorkerConfig};
pub use idle_helper::IdleSamplingHelper;
pub use recorder::{EncodedProfile, StackRecorder};
pub use runtime::{HostRuntime, ThreadRef, TracepointHooks};
pub use sampling_rate::DynamicSamplingRate;
pub use thread_context::ThreadContextCollector;
pub use worker::{CpuAndWallTimeWorker, WorkerStatsSnapshot};

// Core types
pub type Result<T> = std::result::Result<T, Error>;
pub use error::Error;
