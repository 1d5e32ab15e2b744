//! Synchronisation services used by the workers
//!
//! Thin wrappers over `parking_lot` and `std::thread` that give the runtime
//! the platform primitives it expects: auto/manual-reset events with a bounded
//! wait, and worker threads that stop cooperatively.
//!
//! A worker is never killed. `Worker::stop` raises a stop flag and sets the
//! worker's wake event; the worker sees the flag when its wait returns and
//! leaves its loop between units of work.

use crate::types::{NodeError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Reset behaviour of an [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// A successful wait clears the event and releases one waiter
    Auto,
    /// The event stays set until `reset` is called and releases every waiter
    Manual,
}

/// A settable event with a timeout-bounded wait
#[derive(Debug)]
pub struct Event {
    mode: ResetMode,
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Create an event in the given initial state
    pub fn new(mode: ResetMode, initial_state: bool) -> Self {
        Self {
            mode,
            signalled: Mutex::new(initial_state),
            cond: Condvar::new(),
        }
    }

    /// Auto-reset event, initially clear
    pub fn auto() -> Self {
        Self::new(ResetMode::Auto, false)
    }

    /// Manual-reset event, initially clear
    pub fn manual() -> Self {
        Self::new(ResetMode::Manual, false)
    }

    /// Signal the event
    pub fn set(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        match self.mode {
            ResetMode::Auto => {
                self.cond.notify_one();
            }
            ResetMode::Manual => {
                self.cond.notify_all();
            }
        }
    }

    /// Clear the event
    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }

    /// Current state without waiting
    pub fn is_set(&self) -> bool {
        *self.signalled.lock()
    }

    /// Wait until the event is set or `timeout` elapses
    ///
    /// Returns true if the event was set. An auto-reset event is cleared by
    /// the wait that observes it.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signalled = self.signalled.lock();

        while !*signalled {
            if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                break;
            }
        }

        let fired = *signalled;
        if fired && self.mode == ResetMode::Auto {
            *signalled = false;
        }
        fired
    }
}

/// Poll-able stop flag handed to a worker body
#[derive(Debug, Clone)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    /// True once the owner has asked the worker to stop
    pub fn should_stop(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A named worker thread with cooperative shutdown
pub struct Worker {
    name: String,
    stop: Arc<AtomicBool>,
    wake: Arc<Event>,
    exited: Arc<Event>,
    handle: Option<JoinHandle<()>>,
}

/// Sets the exit event even if the body panics
struct ExitGuard(Arc<Event>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

impl Worker {
    /// Spawn a worker
    ///
    /// `wake` is the event the body blocks on; `stop` sets it so the body
    /// notices the stop request without waiting for its timeout.
    pub fn spawn<F>(name: &str, wake: Arc<Event>, body: F) -> Result<Self>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(Event::manual());

        let token = StopToken { flag: stop.clone() };
        let guard = ExitGuard(exited.clone());
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                body(token);
            })?;

        log::debug!("Worker '{}' started", name);

        Ok(Self {
            name: name.to_string(),
            stop,
            wake,
            exited,
            handle: Some(handle),
        })
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the worker body has returned
    pub fn has_exited(&self) -> bool {
        self.exited.is_set()
    }

    /// Ask the worker to stop and wait up to `timeout` for it to exit
    ///
    /// If the worker does not exit in time its thread is detached and
    /// `ShutdownTimeout` is returned.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        self.wake.set();

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        if !self.exited.wait(timeout) {
            log::error!("Worker '{}' did not stop within {:?}", self.name, timeout);
            return Err(NodeError::ShutdownTimeout(self.name.clone()));
        }

        if handle.join().is_err() {
            log::error!("Worker '{}' panicked", self.name);
        }
        log::debug!("Worker '{}' stopped", self.name);
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop(Duration::from_secs(1));
        }
    }
}
