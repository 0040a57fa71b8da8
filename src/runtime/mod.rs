/*!
# Host Runtime Interface

The profiler core runs embedded in a managed runtime that owns a single global interpreter lock.
Everything the core needs from that runtime goes through the [`HostRuntime`] trait.

## Contract

### Threads
- Threads are identified by a [`ThreadRef`] (the runtime's object id for the thread)
- `thread_list` reports live application threads; `is_thread_alive` is used by the dead-thread sweep

### Stacks
- `capture_frames` fills parallel scratch slots, top of the stack first
- A thread whose stack cannot be walked reports [`FrameCapture::InNativeCode`]

### Global lock and safe points
- `lock_owner` reports the native handle of the thread currently holding the lock
- `is_current_thread_holding_lock`, `is_runtime_thread` and `postponed_job_register_one` are
  called from a signal handler and must be async-signal-safe
- `with_lock` / `without_lock` acquire or release the lock around a closure

### Tracepoints
- GC enter/exit and object allocation hooks are delivered through [`TracepointHooks`], which the
  worker implements and registers with `enable_tracepoint`
- GC hooks run while allocation is forbidden and must never fail
*/

pub mod clock;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use clock::{CpuClockId, MonotonicToEpoch};

/// Runtime-level thread identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadRef(pub u64);

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Native OS thread handle, used as a signal target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeThread(pub libc::pthread_t);

impl NativeThread {
    /// Handle of the calling thread
    pub fn current() -> Self {
        // SAFETY: pthread_self has no preconditions.
        NativeThread(unsafe { libc::pthread_self() })
    }
}

/// Source location a thread was started from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeLocation {
    pub file: String,
    pub line: i64,
}

/// A frame reported by the runtime.
///
/// For managed frames `name` is the base label and `path` the source file. For native frames only
/// `name` (the method name) is meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFrame {
    pub name: Option<Arc<str>>,
    pub path: Option<Arc<str>>,
}

impl RawFrame {
    pub fn new(name: impl Into<Arc<str>>, path: impl Into<Arc<str>>) -> Self {
        Self {
            name: Some(name.into()),
            path: Some(path.into()),
        }
    }

    pub fn native(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: Some(name.into()),
            path: None,
        }
    }
}

/// Parallel scratch slots the runtime writes captured frames into
pub struct FrameSlots<'a> {
    pub frames: &'a mut [RawFrame],
    pub lines: &'a mut [i64],
    pub is_managed: &'a mut [bool],
}

impl<'a> FrameSlots<'a> {
    pub fn capacity(&self) -> usize {
        self.frames.len().min(self.lines.len()).min(self.is_managed.len())
    }

    /// Write a frame at `index`; returns false when out of capacity
    pub fn set(&mut self, index: usize, frame: RawFrame, line: i64, is_managed: bool) -> bool {
        if index >= self.capacity() {
            return false;
        }
        self.frames[index] = frame;
        self.lines[index] = line;
        self.is_managed[index] = is_managed;
        true
    }
}

/// Outcome of walking a thread's stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCapture {
    /// Number of frames written into the slots
    Captured(usize),
    /// The thread is alive but its stack cannot be walked (starting up, or parked in native code)
    InNativeCode,
}

/// A deferred callback run by the runtime at its next safe point
pub type PostponedJob = fn();

/// Result of asking the runtime to schedule a postponed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostponedJobResult {
    /// The job queue was full
    Full,
    /// The job was queued
    Success,
    /// The same job was already queued
    AlreadyExisted,
    /// Unrecognized result code
    Unknown(i32),
}

impl PostponedJobResult {
    /// Map the runtime's raw result code
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => PostponedJobResult::Full,
            1 => PostponedJobResult::Success,
            2 => PostponedJobResult::AlreadyExisted,
            other => PostponedJobResult::Unknown(other),
        }
    }
}

/// Runtime tracepoints the worker can enable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TracepointKind {
    /// GC enter and exit events
    Gc,
    /// Object allocation events
    NewObject,
}

/// Internal value types of the managed runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmValueType {
    None,
    Object,
    Class,
    Module,
    Float,
    String,
    Regexp,
    Array,
    Hash,
    Struct,
    Bignum,
    File,
    Data,
    Match,
    Complex,
    Rational,
    Nil,
    True,
    False,
    Symbol,
    Fixnum,
    Undef,
    Imemo,
    Node,
    IClass,
    Zombie,
    Moved,
}

impl VmValueType {
    /// Name used for the `ruby vm type` label
    pub fn as_str(&self) -> &'static str {
        match self {
            VmValueType::None => "T_NONE",
            VmValueType::Object => "T_OBJECT",
            VmValueType::Class => "T_CLASS",
            VmValueType::Module => "T_MODULE",
            VmValueType::Float => "T_FLOAT",
            VmValueType::String => "T_STRING",
            VmValueType::Regexp => "T_REGEXP",
            VmValueType::Array => "T_ARRAY",
            VmValueType::Hash => "T_HASH",
            VmValueType::Struct => "T_STRUCT",
            VmValueType::Bignum => "T_BIGNUM",
            VmValueType::File => "T_FILE",
            VmValueType::Data => "T_DATA",
            VmValueType::Match => "T_MATCH",
            VmValueType::Complex => "T_COMPLEX",
            VmValueType::Rational => "T_RATIONAL",
            VmValueType::Nil => "T_NIL",
            VmValueType::True => "T_TRUE",
            VmValueType::False => "T_FALSE",
            VmValueType::Symbol => "T_SYMBOL",
            VmValueType::Fixnum => "T_FIXNUM",
            VmValueType::Undef => "T_UNDEF",
            VmValueType::Imemo => "T_IMEMO",
            VmValueType::Node => "T_NODE",
            VmValueType::IClass => "T_ICLASS",
            VmValueType::Zombie => "T_ZOMBIE",
            VmValueType::Moved => "T_MOVED",
        }
    }

    /// Whether objects of this type carry a user-visible class
    pub fn has_user_class(&self) -> bool {
        matches!(
            self,
            VmValueType::Object
                | VmValueType::Class
                | VmValueType::Module
                | VmValueType::Float
                | VmValueType::String
                | VmValueType::Regexp
                | VmValueType::Array
                | VmValueType::Hash
                | VmValueType::Struct
                | VmValueType::Bignum
                | VmValueType::File
                | VmValueType::Data
                | VmValueType::Match
                | VmValueType::Complex
                | VmValueType::Rational
                | VmValueType::Nil
                | VmValueType::True
                | VmValueType::False
                | VmValueType::Symbol
                | VmValueType::Fixnum
        )
    }

    /// Class name to use when the object's own class cannot be named
    pub fn fallback_class_name(&self) -> &'static str {
        match self {
            VmValueType::Object => "Object",
            VmValueType::Class => "Class",
            VmValueType::Module => "Module",
            VmValueType::Float => "Float",
            VmValueType::String => "String",
            VmValueType::Regexp => "Regexp",
            VmValueType::Array => "Array",
            VmValueType::Hash => "Hash",
            VmValueType::Struct => "Struct",
            VmValueType::Bignum => "Integer",
            VmValueType::File => "File",
            VmValueType::Data => "(VM Internal, T_DATA)",
            VmValueType::Match => "MatchData",
            VmValueType::Complex => "Complex",
            VmValueType::Rational => "Rational",
            VmValueType::Nil => "NilClass",
            VmValueType::True => "TrueClass",
            VmValueType::False => "FalseClass",
            VmValueType::Symbol => "Symbol",
            VmValueType::Fixnum => "Integer",
            _ => "(VM Internal, Missing class)",
        }
    }
}

/// Class information of a freshly allocated object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectClass {
    /// The object has a class with this name (may be empty for anonymous classes)
    Named(String),
    /// The runtime allocated the object without a class
    Missing,
}

/// Object handed to the allocation tracepoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedObject {
    pub vm_type: VmValueType,
    pub class: ObjectClass,
}

impl AllocatedObject {
    pub fn new(vm_type: VmValueType, class_name: impl Into<String>) -> Self {
        Self {
            vm_type,
            class: ObjectClass::Named(class_name.into()),
        }
    }

    pub fn without_class(vm_type: VmValueType) -> Self {
        Self {
            vm_type,
            class: ObjectClass::Missing,
        }
    }
}

/// Active trace for a thread, as seen by the tracer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub local_root_span_id: Option<u64>,
    pub span_id: Option<u64>,
    pub root_span_type: Option<String>,
    pub trace_resource: Option<String>,
    pub root_span_resource: Option<String>,
}

/// Callbacks the runtime invokes from its tracepoints
pub trait TracepointHooks: Send + Sync {
    /// GC is about to start on the current thread. Must not allocate or fail.
    fn on_gc_enter(&self);

    /// GC just finished on the current thread. Must not allocate or fail.
    fn on_gc_exit(&self);

    /// An object was allocated on the current thread
    fn on_new_object(&self, object: &AllocatedObject);
}

/// Services the profiler needs from the managed runtime
pub trait HostRuntime: Send + Sync {
    /// Thread running the caller
    fn current_thread(&self) -> ThreadRef;

    /// The runtime's main thread
    fn main_thread(&self) -> ThreadRef;

    /// Fill `out` with all live application threads
    fn thread_list(&self, out: &mut Vec<ThreadRef>);

    fn is_thread_alive(&self, thread: ThreadRef) -> bool;

    fn thread_name(&self, thread: ThreadRef) -> Option<String>;

    fn native_thread_id(&self, thread: ThreadRef) -> u64;

    /// Where the thread's entry block was defined, if managed
    fn invoke_location(&self, thread: ThreadRef) -> Option<InvokeLocation>;

    /// Per-thread CPU clock, if the platform provides one
    fn cpu_clock_for(&self, thread: ThreadRef) -> Option<CpuClockId>;

    fn read_cpu_clock(&self, clock: CpuClockId) -> Option<i64> {
        clock::read_cpu_clock(clock)
    }

    fn monotonic_wall_time_ns(&self) -> Option<i64> {
        clock::monotonic_now_ns()
    }

    fn system_epoch_time_ns(&self) -> Option<i64> {
        clock::system_epoch_now_ns()
    }

    /// Walk `thread`'s stack into `slots`, top of the stack first
    fn capture_frames(&self, thread: ThreadRef, slots: FrameSlots<'_>) -> FrameCapture;

    /// Total depth of `thread`'s stack
    fn stack_depth(&self, thread: ThreadRef) -> usize;

    /// Tracer correlation for `thread`
    fn trace_context(&self, _thread: ThreadRef) -> Option<TraceContext> {
        None
    }

    /// Native handle of the current lock holder
    fn lock_owner(&self) -> Option<NativeThread>;

    /// Async-signal-safe
    fn is_current_thread_holding_lock(&self) -> bool;

    /// Async-signal-safe. False for native threads the runtime does not manage.
    fn is_runtime_thread(&self) -> bool {
        true
    }

    /// Acquire the global lock, run `f`, release it
    fn with_lock(&self, f: &mut dyn FnMut());

    /// Release the global lock held by the caller, run `f`, re-acquire it
    fn without_lock(&self, f: &mut dyn FnMut());

    /// Async-signal-safe. Queue `job` to run at the next safe point unless already queued.
    fn postponed_job_register_one(&self, job: PostponedJob) -> PostponedJobResult;

    fn enable_tracepoint(&self, kind: TracepointKind, hooks: Arc<dyn TracepointHooks>);

    fn disable_tracepoint(&self, kind: TracepointKind);
}
