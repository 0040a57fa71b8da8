/*!
# Error Module

Crate-wide error type for the profiler core.

## Error Categories

- **Configuration errors**: invalid numeric bounds at construction time. Never retried.
- **Start-up conflicts**: another sampler instance already owns the profiling signal.
- **Sampling failures**: raised at the safe-point boundary, stored on the worker and re-raised on
  the worker thread once the trigger loop has been torn down.
- **Invariant violations**: conditions that indicate a bug (negative CPU-time deltas, both recorder
  slots locked, missing state label). These are raised immediately.
- **Recorder errors**: failures reported by the dual-slot recorder and its profile aggregation.

Signal-handler and GC-hook code paths never produce any of these; anomalies there are counted
instead. See `worker::stats`.
*/

use thiserror::Error;

use crate::recorder::RecorderError;

/// Core profiler errors
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another sampler instance is already running
    #[error("Could not start sampler: {0}")]
    AlreadyRunning(String),

    /// Failure raised while taking a sample
    #[error("Sampling error: {0}")]
    Sampling(String),

    /// Internal invariant was violated
    #[error("{0}")]
    Invariant(String),

    /// Stack recorder error
    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    /// A clock could not be read
    #[error("Clock error: {0}")]
    Clock(String),

    /// OS-level failure (signals, threads)
    #[error("IO error: {0}")]
    Io(String),

    /// Profile encoding error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build an invariant violation using the `BUG:` convention
    pub fn bug(message: impl AsRef<str>) -> Self {
        Error::Invariant(format!("BUG: {}", message.as_ref()))
    }

    /// Whether the error indicates the profiler must not keep going
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::AlreadyRunning(_) => true,
            Error::Invariant(_) => true,
            Error::Recorder(err) => err.is_invariant_violation(),
            Error::Sampling(_) => false,
            Error::Clock(_) => false,
            Error::Io(_) => false,
            Error::Serialization(_) => false,
            Error::Other(_) => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
