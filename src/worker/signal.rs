//! SIGPROF plumbing for the worker.
//!
//! Handlers are installed with `SA_RESTART | SA_SIGINFO`. The profiling handler is never removed
//! once installed: teardown swaps in [`empty_signal_handler`], because a SIGPROF arriving with no
//! handler terminates the process.

use std::io;

use libc::{c_int, c_void, siginfo_t};

use crate::runtime::NativeThread;
use crate::runtime::clock::SECOND_NS;
use crate::{Error, Result};

/// `sa_sigaction`-style handler
pub type SignalHandler = extern "C" fn(c_int, *mut siginfo_t, *mut c_void);

/// Which handler currently owns SIGPROF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigprofHandlerKind {
    Profiling,
    Empty,
    /// Installed by someone else
    Other,
}

pub extern "C" fn empty_signal_handler(_signal: c_int, _info: *mut siginfo_t, _ucontext: *mut c_void) {}

extern "C" fn testing_signal_handler(_signal: c_int, _info: *mut siginfo_t, _ucontext: *mut c_void) {}

fn current_sigaction() -> Result<libc::sigaction> {
    // SAFETY: a zeroed sigaction is a valid out-parameter; a null new action only queries.
    unsafe {
        let mut existing: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGPROF, std::ptr::null(), &mut existing) != 0 {
            return Err(Error::Io(format!(
                "Failed to query existing SIGPROF handler: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(existing)
    }
}

fn set_sigaction(handler: libc::sighandler_t, flags: c_int) -> Result<()> {
    // SAFETY: the action is fully initialized before being handed to sigaction.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = flags;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(libc::SIGPROF, &action, std::ptr::null_mut()) != 0 {
            return Err(Error::Io(format!(
                "Could not install SIGPROF signal handler: {}",
                io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

fn handler_address(handler: SignalHandler) -> libc::sighandler_t {
    handler as *const () as libc::sighandler_t
}

/// Install `handler` for SIGPROF, refusing to replace a handler installed by someone else
pub fn install_sigprof_signal_handler(handler: SignalHandler, handler_pretty_name: &str) -> Result<()> {
    let existing = current_sigaction()?.sa_sigaction;
    let ours = [handler_address(handler), handler_address(empty_signal_handler)];

    if existing != libc::SIG_DFL && existing != libc::SIG_IGN && !ours.contains(&existing) {
        return Err(Error::AlreadyRunning(format!(
            "There's a pre-existing SIGPROF signal handler, refusing to install {}",
            handler_pretty_name
        )));
    }

    set_sigaction(handler_address(handler), libc::SA_RESTART | libc::SA_SIGINFO)
}

/// Swap `expected` for the empty handler. Leaves any other handler alone.
pub fn replace_sigprof_signal_handler_with_empty_handler(expected: SignalHandler) -> Result<()> {
    if current_sigaction()?.sa_sigaction != handler_address(expected) {
        return Ok(());
    }
    set_sigaction(handler_address(empty_signal_handler), libc::SA_RESTART | libc::SA_SIGINFO)
}

/// Restore the default disposition. Only meant for tests.
pub fn remove_sigprof_signal_handler() -> Result<()> {
    set_sigaction(libc::SIG_DFL, 0)
}

pub fn install_testing_signal_handler() -> Result<()> {
    install_sigprof_signal_handler(testing_signal_handler, "testing_signal_handler")
}

pub fn current_sigprof_signal_handler(profiling: SignalHandler) -> Result<Option<SigprofHandlerKind>> {
    let existing = current_sigaction()?.sa_sigaction;

    Ok(if existing == handler_address(profiling) {
        Some(SigprofHandlerKind::Profiling)
    } else if existing == handler_address(empty_signal_handler) {
        Some(SigprofHandlerKind::Empty)
    } else if existing != libc::SIG_DFL {
        Some(SigprofHandlerKind::Other)
    } else {
        None
    })
}

fn sigprof_mask(how: c_int) {
    // SAFETY: the set is initialized by sigemptyset before use.
    unsafe {
        let mut signals: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut signals);
        libc::sigaddset(&mut signals, libc::SIGPROF);
        libc::pthread_sigmask(how, &signals, std::ptr::null_mut());
    }
}

pub fn block_sigprof_in_current_thread() {
    sigprof_mask(libc::SIG_BLOCK);
}

pub fn unblock_sigprof_in_current_thread() {
    sigprof_mask(libc::SIG_UNBLOCK);
}

pub fn is_sigprof_blocked_in_current_thread() -> bool {
    // SAFETY: a null new mask only queries the current one.
    unsafe {
        let mut current: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut current);
        if libc::pthread_sigmask(libc::SIG_BLOCK, std::ptr::null(), &mut current) != 0 {
            return false;
        }
        libc::sigismember(&current, libc::SIGPROF) == 1
    }
}

/// Run `f` with SIGPROF blocked on the calling thread
pub fn with_blocked_sigprof<T>(f: impl FnOnce() -> T) -> T {
    struct Unblock;
    impl Drop for Unblock {
        fn drop(&mut self) {
            unblock_sigprof_in_current_thread();
        }
    }

    block_sigprof_in_current_thread();
    let _unblock = Unblock;
    f()
}

/// Best-effort: the target may have released the lock by the time the signal lands
pub fn send_sigprof(target: NativeThread) {
    // SAFETY: pthread_kill on a stale handle reports ESRCH, which is ignored.
    unsafe {
        libc::pthread_kill(target.0, libc::SIGPROF);
    }
}

/// Sleep for less than one second, resuming after signal interruptions
pub fn sleep_for(time_ns: u64) -> Result<()> {
    if time_ns >= SECOND_NS {
        return Err(Error::Other(format!(
            "sleep_for can only sleep for less than 1 second, time_ns: {}",
            time_ns
        )));
    }

    // SAFETY: zeroed timespec is valid; tv_nsec is below one second.
    let mut time_to_sleep: libc::timespec = unsafe { std::mem::zeroed() };
    time_to_sleep.tv_nsec = time_ns as libc::c_long;

    loop {
        let remaining = time_to_sleep;
        // SAFETY: both pointers reference live timespecs.
        if unsafe { libc::nanosleep(&remaining, &mut time_to_sleep) } == 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
}

/// errno snapshot taken on signal handler entry, restored on exit
pub(crate) struct SavedErrno(c_int);

impl SavedErrno {
    pub(crate) fn save() -> Self {
        // SAFETY: the errno location is thread-local and always valid.
        SavedErrno(unsafe { *errno_location() })
    }
}

impl Drop for SavedErrno {
    fn drop(&mut self) {
        // SAFETY: as above.
        unsafe { *errno_location() = self.0 };
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno_location()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__error()
}
