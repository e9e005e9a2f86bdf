//! scriptbox core - Rhai scripting for real-time audio and MIDI processing.
//!
//! This crate lets a plugin host hand audio blocks and MIDI events to a
//! user-editable Rhai script:
//!
//! - **Runtime** - The single process-wide engine and its execution lock
//! - **Context** - One isolated script namespace per plugin instance
//! - **Bridge** - Per-block MIDI classification, callback dispatch and
//!   output reconstruction
//! - **Codec** - MIDI output templates (`prefix + value + suffix`)
//! - **Reload** - Script file monitoring
//! - **State** - Host state save/restore
//! - **API** - Types and helpers visible to scripts
//!
//! # Architecture
//!
//! Every script execution (load, reload, block processing, globals
//! snapshot) runs under one process-wide lock, taken through
//! [`Runtime::lock`]. Hosts normally only use [`ScriptProcessor`].

pub mod api;
pub mod audio;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod midi;
pub mod processor;
pub mod reload;
pub mod runtime;
pub mod state;

// Re-export main types for convenience
pub use audio::AudioBuffer;
pub use bridge::{CcPickupCache, ProcessReport, ProcessingBridge};
pub use codec::{decode, encode, OutputTemplate, OutputTemplateTable};
pub use config::Config;
pub use context::{Capabilities, ExecutionContext, ExecutionReport};
pub use error::{Error, Result};
pub use midi::{MidiBuffer, MidiEventKind, MidiMessage, TimedMidiEvent};
pub use processor::ScriptProcessor;
pub use reload::{ReloadRequest, ScriptReloadMonitor};
pub use runtime::{Runtime, RuntimeHandle, RuntimeLock};
pub use state::PersistedState;
