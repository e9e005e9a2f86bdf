//! Host state save/restore.
//!
//! The blob handed to the host is a JSON object:
//!
//! ```json
//! {"script_path":"/path/to/script.rhai","editor_width":1024,"editor_height":768,"globals":"{\"gain\":0.5}"}
//! ```
//!
//! `globals` is the context's globals snapshot as text.

use crate::config::{DEFAULT_EDITOR_HEIGHT, DEFAULT_EDITOR_WIDTH};
use crate::context::ExecutionContext;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything a plugin instance hands to the host for its session.
///
/// Missing fields deserialize to their defaults, so older or hand-edited
/// blobs still restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    /// Script file to reload; kept even if the file is currently missing.
    pub script_path: Option<PathBuf>,
    /// Editor window size; zero means "use the default".
    pub editor_width: u32,
    pub editor_height: u32,
    /// Globals snapshot as JSON object text.
    pub globals: String,
}

impl PersistedState {
    /// Encode as the JSON blob handed to the host.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a blob produced by [`PersistedState::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Stored editor size, with zero dimensions replaced by the defaults.
    pub fn editor_size(&self) -> (u32, u32) {
        let width = if self.editor_width == 0 {
            DEFAULT_EDITOR_WIDTH
        } else {
            self.editor_width
        };
        let height = if self.editor_height == 0 {
            DEFAULT_EDITOR_HEIGHT
        } else {
            self.editor_height
        };
        (width, height)
    }
}

/// Capture the context's script path and globals with the editor size.
pub fn save(context: &ExecutionContext, editor_size: (u32, u32)) -> Result<Vec<u8>> {
    let state = PersistedState {
        script_path: context.source_path(),
        editor_width: editor_size.0,
        editor_height: editor_size.1,
        globals: context.globals_snapshot()?,
    };
    log::debug!(
        "Saving state: script {:?}, {} bytes of globals",
        state.script_path,
        state.globals.len()
    );
    state.to_bytes()
}

/// Restore a saved blob into `context`.
///
/// The script is executed first and the globals applied afterwards, so
/// saved values win over the script's defaults. A script that no longer
/// loads is logged and skipped; its path and the globals are still kept.
pub fn restore(context: &ExecutionContext, bytes: &[u8]) -> Result<PersistedState> {
    let state = PersistedState::from_bytes(bytes)?;

    if let Some(path) = &state.script_path {
        context.set_source_path(Some(path.as_path()))?;
        match std::fs::read_to_string(path) {
            Ok(source) => {
                if let Err(err) = context.execute(Some(path.as_path()), &source) {
                    log::warn!("Restored script {} failed: {}", path.display(), err);
                }
            }
            Err(err) => log::warn!("Could not read restored script {}: {}", path.display(), err),
        }
    }

    context.apply_globals_snapshot(&state.globals)?;
    Ok(state)
}
