//! threadboard/crates/configs/src/lib.rs
//!
//! Layered settings: built-in defaults, then `config/default.toml`, then
//! `config/local.toml`, then `THREADBOARD__*` environment variables (after
//! a `.env` file is loaded, if present).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const ENV_PREFIX: &str = "THREADBOARD";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    /// Mount point for every route, e.g. `/board`. Empty mounts at `/`.
    pub route_prefix: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { bind: "127.0.0.1:8080".into(), route_prefix: String::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Directory for the file backend, database file for sqlite.
    pub path: PathBuf,
    pub timeout_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            path: PathBuf::from("./threadboard-data"),
            timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BoardSettings {
    pub names: Vec<String>,
    /// Live threads per board at which pruning starts.
    pub max_threads: usize,
    pub recent_feed_limit: usize,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            names: vec!["b".into(), "cyb".into(), "meta".into()],
            max_threads: 150,
            recent_feed_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModerationSettings {
    /// Rendered signature tags, e.g. `Admin!!AbCdEfGhIj`.
    pub moderators: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    pub dir: PathBuf,
    pub enabled: bool,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self { dir: PathBuf::from("./plugins"), enabled: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { level: "info".into(), format: LogFormat::Pretty }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub board: BoardSettings,
    pub moderation: ModerationSettings,
    pub plugins: PluginSettings,
    pub log: LogSettings,
}

impl Settings {
    /// Loads `.env`, then every layer relative to `./config`.
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!(error = %e, ".env file could not be loaded");
            }
        }
        Self::load_from(Path::new("config"), None)
    }

    /// Loads the layers from `config_dir`. `env` replaces the process
    /// environment when given.
    pub fn load_from(config_dir: &Path, env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let environment = Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("board.names")
            .with_list_parse_key("moderation.moderators")
            .source(env);

        let layer = |name: &str| {
            let path = config_dir.join(name);
            File::with_name(&path.to_string_lossy()).required(false)
        };
        let settings: Settings = Config::builder()
            .add_source(layer("default"))
            .add_source(layer("local"))
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.board.names.is_empty() {
            return invalid("board.names must not be empty".into());
        }
        let mut seen = HashSet::new();
        for name in &self.board.names {
            let well_formed = (1..=3).contains(&name.len())
                && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
            if !well_formed {
                return invalid(format!("board name {name:?} must be 1-3 lowercase alphanumerics"));
            }
            if !seen.insert(name) {
                return invalid(format!("board name {name:?} is listed twice"));
            }
        }
        if self.board.max_threads == 0 {
            return invalid("board.max_threads must be positive".into());
        }
        if self.board.recent_feed_limit == 0 {
            return invalid("board.recent_feed_limit must be positive".into());
        }
        if self.storage.timeout_ms == 0 {
            return invalid("storage.timeout_ms must be positive".into());
        }
        let prefix = &self.server.route_prefix;
        if !prefix.is_empty() && (!prefix.starts_with('/') || prefix.ends_with('/')) {
            return invalid(format!("server.route_prefix {prefix:?} must start with '/' and not end with one"));
        }
        Ok(())
    }
}
