//! Plugin-facing facade.
//!
//! [`ScriptProcessor`] is what a host wrapper talks to: one per plugin
//! instance. It ties together the execution context, the block bridge, the
//! reload monitor and state persistence.

use crate::audio::AudioBuffer;
use crate::bridge::{ProcessReport, ProcessingBridge};
use crate::config::Config;
use crate::context::{ExecutionContext, ExecutionReport};
use crate::error::Result;
use crate::midi::MidiBuffer;
use crate::reload::{ReloadRequest, ScriptReloadMonitor};
use crate::state;
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One plugin instance: script context, block bridge, reload monitor,
/// editor size.
pub struct ScriptProcessor {
    context: Arc<ExecutionContext>,
    bridge: ProcessingBridge,
    config: Config,
    monitor: Option<(ScriptReloadMonitor, Receiver<ReloadRequest>)>,
    editor_size: (u32, u32),
    block_size: usize,
}

impl ScriptProcessor {
    /// Create an instance with no script loaded. Blocks pass through
    /// unchanged until a script is loaded.
    pub fn new(config: Config) -> Self {
        let context = Arc::new(
            ExecutionContext::new().with_import_paths(config.script.import_paths.clone()),
        );
        Self {
            bridge: ProcessingBridge::new(context.clone()),
            context,
            editor_size: (config.editor.width, config.editor.height),
            config,
            monitor: None,
            block_size: 0,
        }
    }

    /// The instance's execution context.
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    /// Configuration the instance was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Read and execute a script file, then monitor it for changes.
    ///
    /// Monitoring starts even if the script faults, so fixing the file on
    /// disk reloads it.
    pub fn load_script(&mut self, path: &Path) -> Result<ExecutionReport> {
        let source = std::fs::read_to_string(path)?;
        self.watch(path);
        self.context.execute(Some(path), &source)
    }

    /// Execute edited source text in place of the current script.
    pub fn set_source(&self, source: &str) -> Result<ExecutionReport> {
        let path = self.context.source_path();
        self.context.execute(path.as_deref(), source)
    }

    /// Bind the host's sample rate and block size before processing starts.
    pub fn prepare(&mut self, sample_rate: f64, block_size: usize) -> Result<()> {
        self.block_size = block_size;
        log::debug!(
            "Preparing context {}: {} Hz, {} samples per block",
            self.context.id(),
            sample_rate,
            block_size
        );
        self.context.bind_sample_rate(sample_rate)
    }

    /// Block size from the last [`ScriptProcessor::prepare`].
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Run one block through the script. See [`ProcessingBridge::process`].
    pub fn process_block(
        &self,
        audio: &mut AudioBuffer,
        midi: &mut MidiBuffer,
    ) -> Result<ProcessReport> {
        self.bridge.process(audio, midi)
    }

    /// Receiver for change notifications of the monitored script, if any.
    pub fn reload_requests(&self) -> Option<&Receiver<ReloadRequest>> {
        self.monitor.as_ref().map(|(_, receiver)| receiver)
    }

    /// Re-execute the script for pending change notifications.
    ///
    /// Meant for the control thread. Returns how many reloads ran.
    pub fn pump_reloads(&self) -> usize {
        let Some((_, receiver)) = &self.monitor else {
            return 0;
        };

        let mut latest: Option<PathBuf> = None;
        while let Ok(request) = receiver.try_recv() {
            latest = Some(request.path);
        }
        let Some(path) = latest else {
            return 0;
        };

        match std::fs::read_to_string(&path) {
            Ok(source) => {
                if let Err(err) = self.context.execute(Some(path.as_path()), &source) {
                    log::warn!("Reload of {} failed: {}", path.display(), err);
                }
                1
            }
            Err(err) => {
                log::warn!("Could not read {}: {}", path.display(), err);
                0
            }
        }
    }

    /// Serialize script path, editor size and globals for the host.
    pub fn save_state(&self) -> Result<Vec<u8>> {
        state::save(&self.context, self.editor_size)
    }

    /// Restore a blob produced by [`ScriptProcessor::save_state`].
    pub fn restore_state(&mut self, bytes: &[u8]) -> Result<()> {
        let restored = state::restore(&self.context, bytes)?;
        self.editor_size = restored.editor_size();
        if let Some(path) = &restored.script_path {
            self.watch(path);
        }
        Ok(())
    }

    /// File name of the loaded script, empty if none.
    pub fn program_name(&self) -> String {
        self.context
            .source_path()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default()
    }

    /// Editor window size as `(width, height)`.
    pub fn editor_size(&self) -> (u32, u32) {
        self.editor_size
    }

    pub fn set_editor_size(&mut self, width: u32, height: u32) {
        self.editor_size = (width, height);
    }

    fn watch(&mut self, path: &Path) {
        if !self.config.reload.enabled {
            return;
        }
        if self
            .monitor
            .as_ref()
            .is_some_and(|(monitor, _)| monitor.path() == path)
        {
            return;
        }
        // Drop (and join) the previous monitor before starting a new one
        self.monitor = None;
        match ScriptReloadMonitor::watch(path, &self.config.reload) {
            Ok(monitor) => self.monitor = Some(monitor),
            Err(err) => log::warn!("Could not monitor {}: {}", path.display(), err),
        }
    }
}
