//! Best-effort thread state classification from the top of a wall-time-only stack.
//!
//! The name list tracks how known runtime versions implement their blocking primitives. It is an
//! approximation: a user method that happens to share a name is only matched if it is also native.

pub const HAD_CPU: &str = "had cpu";
pub const SLEEPING: &str = "sleeping";
pub const WAITING: &str = "waiting";
pub const BLOCKED: &str = "blocked";
pub const NETWORK: &str = "network";
pub const UNKNOWN: &str = "unknown";

/// Queue#pop on newer runtimes is a managed frame with this file name
const THREAD_SYNC_FILE: &str = "<internal:thread_sync>";

/// Classify the topmost frame of a sample that only carries wall time
pub fn classify_top_frame(name: &str, file: &str, is_managed: bool) -> Option<&'static str> {
    if is_managed {
        return (name == "pop" && file == THREAD_SYNC_FILE).then_some(WAITING);
    }

    match name {
        "sleep" => Some(SLEEPING),
        "select" | "pop" => Some(WAITING),
        "synchronize" | "lock" | "join" => Some(BLOCKED),
        "wait_readable" => Some(NETWORK),
        _ => None,
    }
}
