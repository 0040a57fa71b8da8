//! Idle sampling helper.
//!
//! A background thread that runs a callback on request. The trigger loop uses it when no thread
//! holds the global lock: the helper grabs the lock itself and simulates signal delivery.
//!
//! The mailbox holds at most one request. Requests made while another one is pending are dropped.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::Result;

/// Callback executed on the helper thread
pub type IdleAction = Arc<dyn Fn() + Send + Sync>;

enum Mailbox {
    Wait,
    Run(IdleAction),
    Stop,
}

struct Shared {
    mailbox: Mutex<Mailbox>,
    wakeup: Condvar,
}

pub struct IdleSamplingHelper {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IdleSamplingHelper {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                mailbox: Mutex::new(Mailbox::Wait),
                wakeup: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the helper thread. Calling it again while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        {
            let mut mailbox = self.shared.mailbox.lock();
            if matches!(*mailbox, Mailbox::Stop) {
                *mailbox = Mailbox::Wait;
            }
        }

        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("idle-sampling-helper".to_string())
            .spawn(move || idle_sampling_loop(&shared))?;
        *thread = Some(handle);

        info!("Idle sampling helper started");
        Ok(())
    }

    /// Queue `action` unless another request is already pending
    pub fn request_action(&self, action: IdleAction) {
        {
            let mut mailbox = self.shared.mailbox.lock();
            if matches!(*mailbox, Mailbox::Wait) {
                *mailbox = Mailbox::Run(action);
            }
        }
        self.shared.wakeup.notify_all();
    }

    /// Ask the helper thread to exit and wait for it
    pub fn stop(&self) {
        *self.shared.mailbox.lock() = Mailbox::Stop;
        self.shared.wakeup.notify_all();

        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                debug!("Idle sampling helper thread panicked");
            }
            info!("Idle sampling helper stopped");
        }
    }

    /// Drop any pending request and go back to waiting (e.g. in a forked child)
    pub fn reset(&self) {
        *self.shared.mailbox.lock() = Mailbox::Wait;
        // The helper thread does not survive a fork
        let _ = self.thread.lock().take();
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn has_pending_request(&self) -> bool {
        matches!(*self.shared.mailbox.lock(), Mailbox::Run(_))
    }
}

impl Default for IdleSamplingHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IdleSamplingHelper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn idle_sampling_loop(shared: &Shared) {
    loop {
        let action = {
            let mut mailbox = shared.mailbox.lock();
            while matches!(*mailbox, Mailbox::Wait) {
                shared.wakeup.wait(&mut mailbox);
            }

            match std::mem::replace(&mut *mailbox, Mailbox::Wait) {
                Mailbox::Run(action) => action,
                Mailbox::Stop => {
                    *mailbox = Mailbox::Stop;
                    return;
                }
                Mailbox::Wait => continue,
            }
        };

        action();
    }
}
