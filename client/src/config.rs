//! Bridge configuration (`~/.tsbridge/config.toml`).
//!
//! These are the bridge's own settings: how to find and launch the worker
//! and where it should log. The worker's project configuration is its own
//! business.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use tsbridge_types::{ApiVersion, ApiVersionError};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "TSBRIDGE_CONFIG";

const fn default_true() -> bool {
    true
}

fn default_tsserver_path() -> PathBuf {
    PathBuf::from("tsserver")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: WorkerLogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// `tsserver.js` or a worker executable. Bare names are looked up on `PATH`.
    #[serde(default = "default_tsserver_path")]
    pub tsserver_path: PathBuf,
    /// Node runtime for script workers. Defaults to `node` on `PATH`.
    #[serde(default)]
    pub node_path: Option<PathBuf>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Passed to node as `--max-old-space-size`.
    #[serde(default)]
    pub max_memory_mb: Option<u32>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub server_mode: ServerMode,
    /// API version of the worker; the newest known version if unset.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_true")]
    pub cancellation: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tsserver_path: default_tsserver_path(),
            node_path: None,
            working_directory: None,
            max_memory_mb: None,
            locale: None,
            server_mode: ServerMode::default(),
            version: None,
            cancellation: true,
            extra_args: Vec::new(),
            plugins: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn api_version(&self) -> Result<ApiVersion, ApiVersionError> {
        match &self.version {
            Some(version) => version.parse(),
            None => Ok(ApiVersion::LATEST),
        }
    }
}

/// A global plugin to load into the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    /// Directory to probe for the plugin (usually a `node_modules` parent).
    #[serde(default)]
    pub location: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerMode {
    #[default]
    Semantic,
    PartialSemantic,
    Syntactic,
}

impl ServerMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::PartialSemantic => "partialSemantic",
            Self::Syntactic => "syntactic",
        }
    }

    pub const fn capabilities(self) -> Capabilities {
        match self {
            Self::Semantic => Capabilities {
                syntax: true,
                semantic: true,
            },
            Self::PartialSemantic | Self::Syntactic => Capabilities {
                syntax: true,
                semantic: false,
            },
        }
    }
}

/// What kind of questions the running worker can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub syntax: bool,
    pub semantic: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerLogConfig {
    #[serde(default)]
    pub verbosity: LogVerbosity,
    /// Root for per-instance log directories. System temp dir if unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl WorkerLogConfig {
    pub fn enabled(&self) -> bool {
        self.verbosity != LogVerbosity::Off
    }

    pub fn root(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogVerbosity {
    #[default]
    Off,
    Terse,
    Normal,
    RequestTime,
    Verbose,
}

impl LogVerbosity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Terse => "terse",
            Self::Normal => "normal",
            Self::RequestTime => "requestTime",
            Self::Verbose => "verbose",
        }
    }
}

impl BridgeConfig {
    /// Load from [`config_path`]. `Ok(None)` when there is no config file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".tsbridge").join("config.toml"))
}
