//! Execution lock and per-thread state bindings.
//!
//! The engine is shared by every plugin instance in the process but must
//! only be driven by one thread at a time. [`RuntimeLock`] is the single
//! synchronization primitive: acquiring it takes the process-wide mutex,
//! binds the calling thread to its thread state (creating one on first
//! use) and marks that state active. Dropping it deactivates the state and
//! releases the mutex.
//!
//! Thread states are never removed. The set of threads touching the runtime
//! is small (audio, control, one reload monitor per instance).

use crate::error::{Error, Result};
use rhai::module_resolvers::{FileModuleResolver, ModuleResolversCollection};
use rhai::Engine;
use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{Thread, ThreadId};

/// Index of the state created for the thread that started the runtime.
pub(crate) const HOME_STATE: usize = 0;

thread_local! {
    /// Whether the current thread holds the runtime lock.
    static LOCK_HELD: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn lock_held_by_current_thread() -> bool {
    LOCK_HELD.with(|held| held.get())
}

/// Execution slot a thread is bound to while it holds the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadState {
    /// Index in the runtime's state table.
    pub id: usize,
    /// Name of the thread the state was created for.
    pub origin: String,
    /// How many times the state has been activated.
    pub activations: u64,
}

impl ThreadState {
    pub(crate) fn new(id: usize, thread: &Thread) -> Self {
        Self {
            id,
            origin: thread
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", thread.id())),
            activations: 0,
        }
    }
}

/// Everything protected by the runtime mutex.
pub(crate) struct RuntimeCore {
    pub(crate) engine: Engine,
    pub(crate) search_paths: Vec<PathBuf>,
    pub(crate) states: Vec<ThreadState>,
    pub(crate) bindings: HashMap<ThreadId, usize>,
    /// State currently driving the engine.
    pub(crate) active: Option<usize>,
}

impl RuntimeCore {
    fn bind_current_thread(&mut self) -> usize {
        let thread = std::thread::current();
        if let Some(&state) = self.bindings.get(&thread.id()) {
            return state;
        }

        let id = self.states.len();
        let state = ThreadState::new(id, &thread);
        log::debug!("Created thread state {} for thread '{}'", id, state.origin);
        self.states.push(state);
        self.bindings.insert(thread.id(), id);
        id
    }

    fn rebuild_module_resolver(&mut self) {
        let mut collection = ModuleResolversCollection::new();
        for path in &self.search_paths {
            let mut resolver = FileModuleResolver::new_with_path(path.clone());
            // Modules are re-read on every execution so edits are picked up on reload
            resolver.enable_cache(false);
            collection.push(resolver);
        }
        self.engine.set_module_resolver(collection);
    }
}

/// Exclusive access to the runtime for the calling thread.
pub struct RuntimeLock<'a> {
    core: MutexGuard<'a, RuntimeCore>,
    state: usize,
}

impl<'a> RuntimeLock<'a> {
    pub(crate) fn acquire(core: &'a Mutex<RuntimeCore>) -> Result<Self> {
        if lock_held_by_current_thread() {
            return Err(Error::ReentrantLock);
        }

        let mut core = core.lock().unwrap_or_else(|poisoned| {
            log::warn!("Runtime lock was poisoned by a panicking holder; recovering");
            PoisonError::into_inner(poisoned)
        });

        let state = core.bind_current_thread();
        core.states[state].activations += 1;
        core.active = Some(state);
        LOCK_HELD.with(|held| held.set(true));

        Ok(Self { core, state })
    }

    /// The shared engine.
    pub fn engine(&self) -> &Engine {
        &self.core.engine
    }

    /// Thread state the calling thread is bound to.
    pub fn thread_state(&self) -> &ThreadState {
        &self.core.states[self.state]
    }

    /// Number of thread states created so far.
    pub fn thread_state_count(&self) -> usize {
        self.core.states.len()
    }

    /// Current module search path, in resolution order.
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.core.search_paths
    }

    /// Append a directory to the module search path used by `import`.
    ///
    /// The search path is process-wide; directories are never removed.
    pub fn add_search_path(&mut self, dir: &Path) {
        if self.core.search_paths.iter().any(|p| p == dir) {
            return;
        }
        log::debug!("Adding module search path: {}", dir.display());
        self.core.search_paths.push(dir.to_path_buf());
        self.core.rebuild_module_resolver();
    }
}

impl Drop for RuntimeLock<'_> {
    fn drop(&mut self) {
        self.core.active = None;
        LOCK_HELD.with(|held| held.set(false));
    }
}
