//! Scripting runtime lifecycle.
//!
//! The runtime owns the single process-wide Rhai engine. It is created
//! lazily on first use and lives for the rest of the process: plugin
//! instances come and go, the engine does not.
//!
//! All access to the engine goes through [`Runtime::lock`], which returns a
//! [`RuntimeLock`] guard (see [`thread`]).

pub mod thread;

pub use thread::{RuntimeLock, ThreadState};

use crate::api::create_engine;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread::ThreadId;

use thread::{RuntimeCore, HOME_STATE};

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// The process-wide scripting runtime.
pub struct Runtime {
    core: Mutex<RuntimeCore>,
    /// Thread that started the runtime.
    home_thread: ThreadId,
    /// Number of live [`RuntimeHandle`]s.
    instances: AtomicUsize,
}

impl Runtime {
    fn new() -> Self {
        let home = std::thread::current();
        let core = RuntimeCore {
            engine: create_engine(),
            search_paths: Vec::new(),
            states: vec![ThreadState::new(HOME_STATE, &home)],
            bindings: HashMap::from([(home.id(), HOME_STATE)]),
            active: None,
        };

        log::info!(
            "Scripting runtime started (home thread: {})",
            home.name().unwrap_or("<unnamed>")
        );

        Self {
            core: Mutex::new(core),
            home_thread: home.id(),
            instances: AtomicUsize::new(0),
        }
    }

    /// Start the runtime if it isn't running yet and return it.
    ///
    /// Idempotent: only the first call in the process builds the engine and
    /// records the home thread state.
    pub fn ensure_started() -> &'static Runtime {
        RUNTIME.get_or_init(Runtime::new)
    }

    /// Explicit start for embedding applications. Same as [`Runtime::ensure_started`].
    pub fn start() -> &'static Runtime {
        Self::ensure_started()
    }

    /// The runtime, if it has been started.
    pub fn get() -> Option<&'static Runtime> {
        RUNTIME.get()
    }

    /// Whether any context has started the runtime yet.
    pub fn is_started() -> bool {
        RUNTIME.get().is_some()
    }

    /// Register an owning instance.
    ///
    /// The runtime is never torn down; dropping the last handle only rebinds
    /// the dropping thread to the home state.
    pub fn attach(&'static self) -> RuntimeHandle {
        let count = self.instances.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("Runtime instance attached ({} live)", count);
        RuntimeHandle { runtime: self }
    }

    /// Number of live instances.
    pub fn instance_count(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }

    /// Thread that started the runtime.
    pub fn home_thread(&self) -> ThreadId {
        self.home_thread
    }

    /// Rebind the calling thread to the home thread state.
    ///
    /// Called when the last owning instance goes away. Skipped when the
    /// calling thread currently holds the lock.
    pub fn shutdown_home(&self) {
        if thread::lock_held_by_current_thread() {
            log::warn!("shutdown_home called while holding the runtime lock; skipped");
            return;
        }
        let mut core = self.core.lock().unwrap_or_else(PoisonError::into_inner);
        core.bindings
            .insert(std::thread::current().id(), HOME_STATE);
        core.active = None;
        log::debug!("Calling thread rebound to home thread state");
    }

    /// Acquire the runtime for the calling thread.
    ///
    /// Blocks until no other thread holds the lock. Fails with
    /// [`Error::ReentrantLock`](crate::Error::ReentrantLock) if the calling
    /// thread already holds it.
    pub fn lock(&self) -> Result<RuntimeLock<'_>> {
        RuntimeLock::acquire(&self.core)
    }
}

/// Registration of one owning instance (an execution context).
pub struct RuntimeHandle {
    runtime: &'static Runtime,
}

impl RuntimeHandle {
    /// The runtime this handle is attached to.
    pub fn runtime(&self) -> &'static Runtime {
        self.runtime
    }

    /// Acquire the runtime lock. See [`Runtime::lock`].
    pub fn lock(&self) -> Result<RuntimeLock<'static>> {
        self.runtime.lock()
    }
}

impl Clone for RuntimeHandle {
    fn clone(&self) -> Self {
        self.runtime.attach()
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        let previous = self.runtime.instances.fetch_sub(1, Ordering::SeqCst);
        log::debug!("Runtime instance detached ({} live)", previous - 1);
        if previous == 1 {
            self.runtime.shutdown_home();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_runtime_per_process() {
        let a = Runtime::ensure_started();
        let b = Runtime::start();
        assert!(std::ptr::eq(a, b));
        assert!(Runtime::is_started());
        assert!(std::ptr::eq(Runtime::get().unwrap(), a));
    }

    #[test]
    fn test_attach_counts_instances() {
        let runtime = Runtime::ensure_started();
        let handle = runtime.attach();
        let second = handle.clone();
        assert!(runtime.instance_count() >= 2);
        drop(second);
        drop(handle);
    }

    #[test]
    fn test_handle_lock_runs_script() {
        let handle = Runtime::ensure_started().attach();
        let lock = handle.lock().unwrap();
        let value: i64 = lock.engine().eval("40 + 2").unwrap();
        assert_eq!(value, 42);
    }
}
