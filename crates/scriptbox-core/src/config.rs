//! Configuration file support for scriptbox
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/scriptbox/config.toml`
//! - macOS: `~/Library/Application Support/scriptbox/config.toml`
//! - Windows: `%APPDATA%\scriptbox\config.toml`

use crate::error::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Editor width used when none is stored.
pub const DEFAULT_EDITOR_WIDTH: u32 = 1024;
/// Editor height used when none is stored.
pub const DEFAULT_EDITOR_HEIGHT: u32 = 768;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub reload: ReloadSettings,
    pub editor: EditorSettings,
    pub script: ScriptSettings,
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(config) => config,
            Err(Error::Config(_)) => Self::default(),
            Err(err) => {
                log::warn!("Ignoring unreadable config: {}", err);
                Self::default()
            }
        }
    }

    /// Load configuration from `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to the default config file location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "scriptbox") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }
}

/// Script file monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadSettings {
    /// Re-execute scripts when they change on disk
    pub enabled: bool,
    /// Sleep between cancellation checks, in milliseconds
    pub yield_ms: u64,
    /// Interval between modification-time checks, in milliseconds
    pub poll_ms: u64,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            yield_ms: 25,
            poll_ms: 2000,
        }
    }
}

/// Default editor geometry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorSettings {
    pub width: u32,
    pub height: u32,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_EDITOR_WIDTH,
            height: DEFAULT_EDITOR_HEIGHT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    /// Extra directories searched by `import`
    pub import_paths: Vec<PathBuf>,
}
