//! Error types for scriptbox-core.

use thiserror::Error;

/// Result type alias for scriptbox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running scripts against audio/MIDI blocks.
#[derive(Debug, Error)]
pub enum Error {
    /// The calling thread already holds the runtime lock.
    #[error("runtime lock is already held by this thread")]
    ReentrantLock,

    /// The script failed to compile.
    #[error("Compile error: {0}")]
    Compile(String),

    /// Top-level script evaluation failed.
    #[error("Script error: {0}")]
    Eval(String),

    /// A script-declared callback failed.
    #[error("Callback `{callback}` failed: {message}")]
    Callback {
        callback: &'static str,
        message: String,
    },

    /// The script returned something other than a list of output templates.
    #[error("Invalid output template: {0}")]
    InvalidTemplate(String),

    /// The message cannot be expressed as a single-variable-byte template.
    #[error("Unsupported MIDI message: {0}")]
    UnsupportedMessage(String),

    /// A reconstructed data byte does not fit in 7 bits.
    #[error("MIDI data byte out of range: {0}")]
    DataByteOutOfRange(i64),

    /// A globals snapshot parsed to something other than an object.
    #[error("Globals snapshot must be a JSON object, got {0}")]
    InvalidGlobals(String),

    /// Globals snapshot or persisted state could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a callback error from a Rhai runtime error.
    pub fn callback(callback: &'static str, err: Box<rhai::EvalAltResult>) -> Self {
        Error::Callback {
            callback,
            message: err.to_string(),
        }
    }
}

impl From<rhai::ParseError> for Error {
    fn from(err: rhai::ParseError) -> Self {
        Error::Compile(err.to_string())
    }
}

impl From<Box<rhai::EvalAltResult>> for Error {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        Error::Eval(err.to_string())
    }
}
