// Local configuration for the daemon and the CLI.
//
// Global config: `~/.workloop/config.toml`
// Default data directory: `~/.workloop/data`

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::autorun::prompt::DEFAULT_CONTINUE_MESSAGE;
use crate::fanout::DEFAULT_QUEUE_CAPACITY;
use crate::fs_perms::{ensure_owner_only_dir, ensure_owner_only_file};
use crate::watcher::debounce::DebounceConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "WORKLOOP_DATA_DIR";

/// Root directory for workloop global state: `~/.workloop/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".workloop"))
}

/// Path to the global config file: `~/.workloop/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding one subdirectory per entity.
    pub data_dir: Option<PathBuf>,
    pub reconcile: ReconcileConfig,
    pub notifier: NotifierConfig,
    pub autorun: AutorunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Quiet period before an external index change is absorbed.
    pub debounce_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { debounce_ms: DebounceConfig::default().window.as_millis() as u64 }
    }
}

impl ReconcileConfig {
    pub fn debounce(&self) -> DebounceConfig {
        DebounceConfig::with_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifierConfig {
    /// Per-store event queue; the newest event is dropped when full.
    pub queue_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { queue_capacity: DEFAULT_QUEUE_CAPACITY }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutorunConfig {
    /// Sent to an idle session whose work item is still in progress.
    pub continue_message: String,
}

impl Default for AutorunConfig {
    fn default() -> Self {
        Self { continue_message: DEFAULT_CONTINUE_MESSAGE.to_string() }
    }
}

impl DaemonConfig {
    /// Load `~/.workloop/config.toml`. A missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match global_config_path() {
            Some(path) => Self::load_or_default(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from `path`, or defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(ConfigError::Parse),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(ConfigError::Io(error)),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
            ensure_owner_only_dir(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents)
            .and_then(|()| ensure_owner_only_file(path))
            .map_err(ConfigError::Io)
    }

    /// Data directory: explicit override, then `WORKLOOP_DATA_DIR`, then the
    /// config file, then `~/.workloop/data`.
    pub fn resolve_data_dir(&self, explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        self.resolve_data_dir_with(explicit, std::env::var_os(DATA_DIR_ENV))
    }

    fn resolve_data_dir_with(
        &self,
        explicit: Option<&Path>,
        env: Option<OsString>,
    ) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = explicit {
            return Ok(dir.to_path_buf());
        }
        if let Some(dir) = env.filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        global_dir().map(|d| d.join("data")).ok_or(ConfigError::NoHomeDir)
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    NoHomeDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
            Self::NoHomeDir => write!(f, "could not determine home directory"),
        }
    }
}

impl std::error::Error for ConfigError {}
