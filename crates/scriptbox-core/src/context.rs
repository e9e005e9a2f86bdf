//! Per-instance script namespace.
//!
//! An [`ExecutionContext`] owns everything one plugin instance knows about
//! its script: the top-level scope, the compiled script with its probed
//! capabilities and output templates, the `globals` map, and the host-bound
//! sample rate.
//!
//! Script functions cannot see top-level variables, so callbacks are called
//! as methods on an instance object:
//!
//! ```rhai
//! globals.gain = 0.5;              // top level: `globals` is a variable
//!
//! fn process_controls(inputs, outputs) {
//!     this.globals.last = inputs[7];   // callbacks: `this.globals`
//!     outputs[0] = inputs[7];
//! }
//! ```
//!
//! Lock order: the per-context state mutex is only taken while the runtime
//! lock is held, or on its own for read-only accessors that never go on to
//! take the runtime lock.

use crate::api::midi::templates_from_dynamic;
use crate::bridge::CcPickupCache;
use crate::codec::OutputTemplateTable;
use crate::error::{Error, Result};
use crate::runtime::{Runtime, RuntimeHandle};
use rhai::{CallFnOptions, Dynamic, Engine, FuncArgs, Map, Scope, AST};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Sample rate bound before the host calls `prepare`.
pub const DEFAULT_SAMPLE_RATE: i64 = 44_100;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Entry points a script declares, probed once per execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub midi_outputs: bool,
    pub process_audio: bool,
    pub process_controls: bool,
    pub process_notes: bool,
    pub process_program_changes: bool,
}

impl Capabilities {
    /// Look up each entry point in `ast` by name and parameter count.
    pub fn probe(ast: &AST) -> Self {
        let declares = |name: &str, arity: usize| {
            ast.iter_functions()
                .any(|f| f.name == name && f.params.len() == arity)
        };
        Self {
            midi_outputs: declares("midi_outputs", 0),
            process_audio: declares("process_audio", 2),
            process_controls: declares("process_controls", 2),
            process_notes: declares("process_notes", 3),
            process_program_changes: declares("process_program_changes", 2),
        }
    }
}

impl std::fmt::Display for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (self.midi_outputs, "midi_outputs"),
            (self.process_audio, "process_audio"),
            (self.process_controls, "process_controls"),
            (self.process_notes, "process_notes"),
            (self.process_program_changes, "process_program_changes"),
        ];
        let declared: Vec<&str> = names
            .iter()
            .filter(|(has, _)| *has)
            .map(|(_, name)| *name)
            .collect();
        if declared.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", declared.join(", "))
        }
    }
}

/// A successfully executed script. Replaced as a whole on every execution.
pub(crate) struct CompiledScript {
    pub(crate) ast: AST,
    pub(crate) capabilities: Capabilities,
    pub(crate) templates: OutputTemplateTable,
    pub(crate) pickup: CcPickupCache,
}

impl CompiledScript {
    fn new(ast: AST) -> Self {
        Self {
            capabilities: Capabilities::probe(&ast),
            ast,
            templates: OutputTemplateTable::default(),
            pickup: CcPickupCache::default(),
        }
    }

    /// Installed after a fault: no entry points, nothing to reconstruct.
    fn empty() -> Self {
        Self {
            ast: AST::empty(),
            capabilities: Capabilities::default(),
            templates: OutputTemplateTable::default(),
            pickup: CcPickupCache::default(),
        }
    }
}

/// Outcome of a successful [`ExecutionContext::execute`].
#[derive(Debug)]
pub struct ExecutionReport {
    pub capabilities: Capabilities,
    /// Number of declared MIDI outputs.
    pub outputs: usize,
    /// Why the output table is empty despite `midi_outputs()` being declared.
    pub template_fault: Option<Error>,
}

pub(crate) struct ContextState {
    scope: Scope<'static>,
    pub(crate) globals: Map,
    sample_rate: i64,
    pub(crate) script: CompiledScript,
    /// Globals supplied from outside (restored state), refreshed with the
    /// live values before every re-execution.
    stored_globals: Map,
    source_path: Option<PathBuf>,
}

impl ContextState {
    fn new() -> Self {
        Self {
            scope: Scope::new(),
            globals: Map::new(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            script: CompiledScript::empty(),
            stored_globals: Map::new(),
            source_path: None,
        }
    }

    fn reset(&mut self, source_path: Option<&Path>) {
        self.refresh_stored_globals();
        self.scope = Scope::new();
        self.globals = Map::new();
        self.script = CompiledScript::empty();
        self.source_path = source_path.map(Path::to_path_buf);
    }

    fn run(&mut self, engine: &Engine, source: &str) -> Result<ExecutionReport> {
        let mut ast = engine.compile(source)?;
        if let Some(path) = &self.source_path {
            ast.set_source(path.display().to_string());
        }

        self.scope.push("globals", Map::new());
        self.scope.push("sample_rate", self.sample_rate);
        engine.run_ast_with_scope(&mut self.scope, &ast)?;

        self.globals = match self.scope.get_value::<Map>("globals") {
            Some(globals) => globals,
            None => {
                log::warn!("Script replaced `globals` with a non-map value; using an empty map");
                Map::new()
            }
        };
        self.script = CompiledScript::new(ast);

        let capabilities = self.script.capabilities;
        let mut template_fault = None;
        if capabilities.midi_outputs {
            match self
                .call(engine, "midi_outputs", ())
                .and_then(templates_from_dynamic)
            {
                Ok(templates) => self.script.templates = templates,
                Err(err) => {
                    log::warn!("Ignoring MIDI outputs: {}", err);
                    template_fault = Some(err);
                }
            }
        }

        Ok(ExecutionReport {
            capabilities,
            outputs: self.script.templates.len(),
            template_fault,
        })
    }

    /// Copy the live value of every stored key back into the store, so a
    /// re-execution restores what callbacks last wrote rather than the
    /// values from restore time.
    fn refresh_stored_globals(&mut self) {
        for (key, stored) in self.stored_globals.iter_mut() {
            if let Some(live) = self.globals.get(key) {
                *stored = live.clone();
            }
        }
    }

    /// Merge the stored globals into the live map; stored values win.
    fn merge_stored_globals(&mut self) {
        self.globals
            .extend(self.stored_globals.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    fn instance_object(&mut self) -> Dynamic {
        let mut this = Map::new();
        this.insert(
            "globals".into(),
            Dynamic::from_map(std::mem::take(&mut self.globals)),
        );
        this.insert("sample_rate".into(), Dynamic::from_int(self.sample_rate));
        Dynamic::from_map(this)
    }

    fn restore_instance_object(&mut self, this: Dynamic) {
        let globals = this
            .try_cast::<Map>()
            .and_then(|mut this| this.remove("globals"))
            .and_then(|globals| globals.try_cast::<Map>());
        self.globals = globals.unwrap_or_else(|| {
            log::warn!("Callback replaced `this` or `this.globals`; globals reset");
            Map::new()
        });
    }

    /// Call a script function with `this` bound to the instance object.
    pub(crate) fn call(
        &mut self,
        engine: &Engine,
        name: &'static str,
        args: impl FuncArgs,
    ) -> Result<Dynamic> {
        let mut this = self.instance_object();
        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(&mut this);
        let result =
            engine.call_fn_with_options::<Dynamic>(options, &mut self.scope, &self.script.ast, name, args);
        self.restore_instance_object(this);
        result.map_err(|err| Error::callback(name, err))
    }
}

fn parse_globals(text: &str) -> Result<Map> {
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    let value: Dynamic = serde_json::from_str(text)?;
    let type_name = value.type_name();
    value
        .try_cast::<Map>()
        .ok_or_else(|| Error::InvalidGlobals(type_name.to_string()))
}

/// One plugin instance's script namespace.
pub struct ExecutionContext {
    id: u64,
    runtime: RuntimeHandle,
    import_paths: Vec<PathBuf>,
    state: Mutex<ContextState>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Create a context, starting the runtime if needed.
    pub fn new() -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!("Creating execution context {}", id);
        Self {
            id,
            runtime: Runtime::ensure_started().attach(),
            import_paths: Vec::new(),
            state: Mutex::new(ContextState::new()),
        }
    }

    /// Extra directories searched by `import`, after the script's own directory.
    pub fn with_import_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.import_paths = paths;
        self
    }

    /// Process-unique id, used in log messages.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn state_mut(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the engine and this context's state, under the runtime lock.
    pub(crate) fn with_locked<R>(
        &self,
        f: impl FnOnce(&Engine, &mut ContextState) -> R,
    ) -> Result<R> {
        let lock = self.runtime.lock()?;
        let mut state = self.state_mut();
        Ok(f(lock.engine(), &mut state))
    }

    /// Replace the namespace and execute `source` in it.
    ///
    /// On a compile or evaluation fault the context is left with no entry
    /// points and no outputs, and the fault is returned. Stored globals are
    /// merged in either case.
    pub fn execute(&self, source_path: Option<&Path>, source: &str) -> Result<ExecutionReport> {
        let mut lock = self.runtime.lock()?;

        if let Some(dir) = source_path
            .and_then(Path::parent)
            .filter(|dir| !dir.as_os_str().is_empty())
        {
            lock.add_search_path(dir);
        }
        for dir in &self.import_paths {
            lock.add_search_path(dir);
        }

        let mut state = self.state_mut();
        state.reset(source_path);
        let result = state.run(lock.engine(), source);
        state.merge_stored_globals();

        match &result {
            Ok(report) => log::info!(
                "Executed {} (context {}): capabilities [{}], {} MIDI outputs",
                source_path
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<inline>".to_string()),
                self.id,
                report.capabilities,
                report.outputs
            ),
            Err(err) => log::debug!("Execution failed in context {}: {}", self.id, err),
        }
        result
    }

    /// Serialize the globals map as compact JSON.
    pub fn globals_snapshot(&self) -> Result<String> {
        self.with_locked(|_, state| {
            serde_json::to_string(&Dynamic::from_map(state.globals.clone())).map_err(Error::from)
        })?
    }

    /// Store `text` as the external globals and merge it into the live map.
    ///
    /// Empty text clears the store without touching the live map.
    pub fn apply_globals_snapshot(&self, text: &str) -> Result<()> {
        let persisted = parse_globals(text)?;
        self.with_locked(|_, state| {
            state
                .globals
                .extend(persisted.iter().map(|(k, v)| (k.clone(), v.clone())));
            state.stored_globals = persisted;
        })
    }

    /// Bind the host sample rate, visible as `sample_rate` / `this.sample_rate`.
    pub fn bind_sample_rate(&self, rate: f64) -> Result<()> {
        let rate = rate.round() as i64;
        self.with_locked(|_, state| {
            state.sample_rate = rate;
            state.scope.set_value("sample_rate", rate);
        })
    }

    /// Sample rate last bound by the host, in whole Hz.
    pub fn sample_rate(&self) -> i64 {
        self.state_mut().sample_rate
    }

    /// Entry points of the current script; all `false` after a fault.
    pub fn capabilities(&self) -> Capabilities {
        self.state_mut().script.capabilities
    }

    /// Copy of the current MIDI output table, indexed by output slot.
    pub fn output_templates(&self) -> OutputTemplateTable {
        self.state_mut().script.templates.clone()
    }

    /// Path of the script this context belongs to, if it came from a file.
    pub fn source_path(&self) -> Option<PathBuf> {
        self.state_mut().source_path.clone()
    }

    /// Record the script path without executing anything.
    ///
    /// Used when restored state names a script that can't be read yet; the
    /// path is still saved again and shown as the program name.
    pub fn set_source_path(&self, path: Option<&Path>) -> Result<()> {
        self.with_locked(|_, state| state.source_path = path.map(Path::to_path_buf))
    }

    /// Value of a top-level global, mainly for hosts and tests.
    pub fn global(&self, name: &str) -> Option<Dynamic> {
        self.state_mut().globals.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ControlMap;
    use std::io::Write;

    #[test]
    fn test_capabilities_probe_by_name_and_arity() {
        let ctx = ExecutionContext::new();
        let report = ctx
            .execute(
                None,
                r#"
                    fn midi_outputs() { [] }
                    fn process_controls(inputs, outputs) {}
                    fn process_notes(inputs, outputs) {}
                "#,
            )
            .unwrap();
        assert!(report.capabilities.midi_outputs);
        assert!(report.capabilities.process_controls);
        assert!(!report.capabilities.process_notes);
        assert!(!report.capabilities.process_audio);
        assert_eq!(report.outputs, 0);
    }

    #[test]
    fn test_execute_builds_template_table() {
        let ctx = ExecutionContext::new();
        ctx.execute(
            None,
            "fn midi_outputs() { controller_event(7) + controller_event(10) }",
        )
        .unwrap();
        let templates = ctx.output_templates();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates.get(1).unwrap().prefix, vec![0xB0, 10]);
    }

    #[test]
    fn test_bad_midi_outputs_leaves_table_empty() {
        let ctx = ExecutionContext::new();
        let report = ctx
            .execute(None, "fn midi_outputs() { 42 }")
            .unwrap();
        assert!(report.template_fault.is_some());
        assert!(ctx.output_templates().is_empty());
    }

    #[test]
    fn test_compile_fault_installs_empty_script() {
        let ctx = ExecutionContext::new();
        ctx.execute(None, "fn midi_outputs() { controller_event(7) }")
            .unwrap();
        assert_eq!(ctx.output_templates().len(), 1);

        let err = ctx.execute(None, "fn broken( {").unwrap_err();
        assert!(matches!(err, Error::Compile(_)));
        assert_eq!(ctx.capabilities(), Capabilities::default());
        assert!(ctx.output_templates().is_empty());
    }

    #[test]
    fn test_eval_fault_installs_empty_script() {
        let ctx = ExecutionContext::new();
        let err = ctx
            .execute(
                None,
                "fn process_controls(i, o) {} throw \"boom\";",
            )
            .unwrap_err();
        assert!(matches!(err, Error::Eval(_)));
        assert!(!ctx.capabilities().process_controls);
    }

    #[test]
    fn test_top_level_globals_and_sample_rate() {
        let ctx = ExecutionContext::new();
        ctx.bind_sample_rate(48_000.0).unwrap();
        ctx.execute(None, "globals.rate = sample_rate; globals.gain = 0.5;")
            .unwrap();
        assert_eq!(ctx.global("rate").unwrap().as_int().unwrap(), 48_000);
        assert_eq!(ctx.global("gain").unwrap().as_float().unwrap(), 0.5);
    }

    #[test]
    fn test_callback_mutates_this_globals() {
        let ctx = ExecutionContext::new();
        ctx.execute(
            None,
            r#"
                globals.count = 0;
                fn bump() { this.globals.count += 1; this.sample_rate }
            "#,
        )
        .unwrap();

        let rate = ctx
            .with_locked(|engine, state| state.call(engine, "bump", ()))
            .unwrap()
            .unwrap();
        assert_eq!(rate.as_int().unwrap(), DEFAULT_SAMPLE_RATE);
        ctx.with_locked(|engine, state| state.call(engine, "bump", ()))
            .unwrap()
            .unwrap();
        assert_eq!(ctx.global("count").unwrap().as_int().unwrap(), 2);
    }

    #[test]
    fn test_snapshot_round_trip_overrides_defaults() {
        let ctx = ExecutionContext::new();
        ctx.execute(None, "globals.a = 1; globals.b = \"x\";").unwrap();
        ctx.with_locked(|_, state| {
            state.globals.insert("a".into(), Dynamic::from_int(5));
        })
        .unwrap();
        let snapshot = ctx.globals_snapshot().unwrap();

        let other = ExecutionContext::new();
        other.execute(None, "globals.a = 1; globals.c = true;").unwrap();
        other.apply_globals_snapshot(&snapshot).unwrap();
        assert_eq!(other.global("a").unwrap().as_int().unwrap(), 5);
        assert_eq!(other.global("b").unwrap().into_string().unwrap(), "x");
        assert!(other.global("c").unwrap().as_bool().unwrap());

        // Stored globals survive re-execution and still win over defaults
        other.execute(None, "globals.a = 2;").unwrap();
        assert_eq!(other.global("a").unwrap().as_int().unwrap(), 5);
    }

    #[test]
    fn test_reexecution_keeps_live_values_of_restored_globals() {
        let source = r#"
            globals.gain = 0;
            globals.mode = "default";
            fn process_controls(inputs, outputs) { this.globals.gain = inputs[7]; }
        "#;
        let ctx = ExecutionContext::new();
        ctx.execute(None, source).unwrap();
        ctx.apply_globals_snapshot(r#"{"gain":10}"#).unwrap();
        assert_eq!(ctx.global("gain").unwrap().as_int().unwrap(), 10);

        let inputs: ControlMap = [(7, 99)].into_iter().collect();
        let outputs = ControlMap::new();
        ctx.with_locked(|engine, state| {
            state.call(engine, "process_controls", (inputs.clone(), outputs.clone()))
        })
        .unwrap()
        .unwrap();
        assert_eq!(ctx.global("gain").unwrap().as_int().unwrap(), 99);

        ctx.execute(None, source).unwrap();
        assert_eq!(ctx.global("gain").unwrap().as_int().unwrap(), 99);
        assert_eq!(ctx.global("mode").unwrap().into_string().unwrap(), "default");

        // Also carried across a faulting execution
        assert!(ctx.execute(None, "fn broken( {").is_err());
        assert_eq!(ctx.global("gain").unwrap().as_int().unwrap(), 99);
    }

    #[test]
    fn test_set_source_path_without_execution() {
        let ctx = ExecutionContext::new();
        let path = PathBuf::from("/nonexistent/scriptbox/later.rhai");
        ctx.set_source_path(Some(path.as_path())).unwrap();
        assert_eq!(ctx.source_path(), Some(path));
        assert_eq!(ctx.capabilities(), Capabilities::default());
    }

    #[test]
    fn test_apply_snapshot_rejects_non_object() {
        let ctx = ExecutionContext::new();
        assert!(matches!(
            ctx.apply_globals_snapshot("[1, 2]"),
            Err(Error::InvalidGlobals(_))
        ));
        assert!(ctx.apply_globals_snapshot("{not json").is_err());
        ctx.apply_globals_snapshot("").unwrap();
    }

    #[test]
    fn test_import_relative_to_script_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut module = std::fs::File::create(dir.path().join("shared_helpers.rhai")).unwrap();
        writeln!(module, "fn twice(x) {{ x * 2 }}").unwrap();

        let script = dir.path().join("main.rhai");
        let ctx = ExecutionContext::new();
        ctx.execute(
            Some(script.as_path()),
            "import \"shared_helpers\" as h; globals.v = h::twice(21);",
        )
        .unwrap();
        assert_eq!(ctx.global("v").unwrap().as_int().unwrap(), 42);
        assert_eq!(ctx.source_path(), Some(script));
    }
}
