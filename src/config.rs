//! Command-line configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via FSMKIT_CONFIG or --config)
//! 3. Environment variables

use fsmkit_core::{EngineOptions, LockingMode};
use fsmkit_storage::{SqliteStoreConfig, DEFAULT_TABLE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// fsmkit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where machine definitions are read from.
    pub definitions: DefinitionsConfig,
    /// State record storage.
    pub store: StoreConfig,
    /// Engine behavior.
    pub engine: EngineOptions,
    /// Change notification.
    pub notify: NotifyConfig,
}

impl Config {
    /// Loads the file at `path` if given, then applies environment
    /// overrides.
    ///
    /// A file that was asked for but cannot be read or parsed is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `FSMKIT_*` overrides read through `var`. Unparsable values
    /// are ignored with a warning.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("FSMKIT_DEFINITIONS_DIR") {
            self.definitions.dir = PathBuf::from(dir);
        }

        if let Some(backend) = var("FSMKIT_STORE_BACKEND") {
            match backend.parse() {
                Ok(parsed) => self.store.backend = parsed,
                Err(e) => tracing::warn!("ignoring FSMKIT_STORE_BACKEND: {}", e),
            }
        }

        if let Some(path) = var("FSMKIT_STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }

        if let Some(table) = var("FSMKIT_STORE_TABLE") {
            self.store.table = table;
        }

        if let Some(auto) = var("FSMKIT_STORE_AUTO_CREATE") {
            match auto.parse() {
                Ok(parsed) => self.store.auto_create_table = parsed,
                Err(_) => tracing::warn!("ignoring FSMKIT_STORE_AUTO_CREATE: '{}' is not a bool", auto),
            }
        }

        if let Some(locking) = var("FSMKIT_LOCKING") {
            match locking.parse::<LockingMode>() {
                Ok(parsed) => self.engine.locking = parsed,
                Err(e) => tracing::warn!("ignoring FSMKIT_LOCKING: {}", e),
            }
        }

        if let Some(capacity) = var("FSMKIT_NOTIFY_CAPACITY") {
            match capacity.parse() {
                Ok(parsed) => self.notify.queue_capacity = parsed,
                Err(_) => tracing::warn!("ignoring FSMKIT_NOTIFY_CAPACITY: '{}' is not a number", capacity),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.notify.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "notify.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Sqlite {
            self.store
                .sqlite_config()
                .validate()
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
        }
        Ok(())
    }
}

/// Definition source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionsConfig {
    /// Directory of `*.json` / `*.yaml` / `*.yml` definition documents.
    pub dir: PathBuf,
}

impl Default for DefinitionsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./definitions"),
        }
    }
}

/// Which store backs the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    /// Records live only for the duration of the process.
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// SQLite database file.
    pub path: PathBuf,
    /// SQLite table name.
    pub table: String,
    /// Create the table on startup if missing.
    pub auto_create_table: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: PathBuf::from("./data/fsmkit.db"),
            table: DEFAULT_TABLE.to_string(),
            auto_create_table: true,
        }
    }
}

impl StoreConfig {
    pub fn sqlite_config(&self) -> SqliteStoreConfig {
        SqliteStoreConfig::new(&self.path)
            .with_table(self.table.clone())
            .with_auto_create_table(self.auto_create_table)
    }
}

/// Notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Capacity of the change queue; changes beyond it are dropped.
    pub queue_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
