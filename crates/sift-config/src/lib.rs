//! # Sift Configuration
//!
//! YAML-based configuration for the Sift DNS filtering engine.
//!
//! The engine consumes [`FilteringConfig`] as its persisted state; the control
//! API mutates it at runtime and the host process writes it back to disk.
//! YAML is the default format, JSON and TOML are picked by file extension.

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub mod filter;

pub use filter::{
    FilterListConfig, FilteringConfig, RewriteEntry, DEFAULT_PARENTAL_SENSITIVITY,
    DEFAULT_REPUTATION_UPSTREAM, PARENTAL_SENSITIVITIES,
};

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("File not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main configuration for Sift.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filtering engine settings (persisted).
    pub filtering: FilteringConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Control API configuration.
    pub control: ControlConfig,

    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;

        let config = match Format::from_path(path) {
            Format::Yaml => serde_yaml::from_str(&content)?,
            Format::Json => serde_json::from_str(&content)?,
            Format::Toml => toml::from_str(&content)?,
        };

        Ok(config)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.filtering.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Serializes to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Writes the configuration to a file, in the format implied by its extension.
    ///
    /// The file is written to a sibling temporary path first and then renamed.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = match Format::from_path(path) {
            Format::Yaml => self.to_yaml()?,
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Toml => toml::to_string_pretty(self)?,
        };

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
    Toml,
}

impl Format {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            Some("toml") => Self::Toml,
            _ => Self::Yaml,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,

    /// Log format (text, json).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<()> {
        match self.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::InvalidValue {
                field: "logging.format".to_string(),
                message: format!("expected 'text' or 'json', got '{other}'"),
            }),
        }
    }
}

/// Control API configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Enable the control API.
    pub enabled: bool,

    /// HTTP listen address.
    pub listen: SocketAddr,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3000),
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics collection.
    pub enabled: bool,

    /// Prometheus listen address.
    pub prometheus_listen: Option<SocketAddr>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prometheus_listen: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9153)),
        }
    }
}

/// Thread-safe configuration holder with reload support.
pub struct ConfigHolder {
    config: ArcSwap<Config>,
    path: RwLock<Option<PathBuf>>,
}

impl ConfigHolder {
    /// Creates a new configuration holder.
    pub fn new(config: Config) -> Self {
        Self {
            config: ArcSwap::new(Arc::new(config)),
            path: RwLock::new(None),
        }
    }

    /// Creates a holder from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = Config::from_file(path)?;
        Ok(Self {
            config: ArcSwap::new(Arc::new(config)),
            path: RwLock::new(Some(path.to_path_buf())),
        })
    }

    /// Returns the current configuration.
    pub fn get(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Returns the backing file, if any.
    pub fn path(&self) -> Option<PathBuf> {
        self.path.read().clone()
    }

    /// Sets the backing file.
    pub fn set_path(&self, path: PathBuf) {
        *self.path.write() = Some(path);
    }

    /// Reloads configuration from the file.
    pub fn reload(&self) -> Result<()> {
        let path = self.path.read();
        if let Some(p) = path.as_ref() {
            let config = Config::from_file(p)?;
            config.validate()?;
            self.config.store(Arc::new(config));
        }
        Ok(())
    }

    /// Replaces the filtering section and persists the result if backed by a file.
    pub fn update_filtering(&self, filtering: FilteringConfig) -> Result<()> {
        let mut config = (*self.get()).clone();
        config.filtering = filtering;
        if let Some(p) = self.path.read().as_ref() {
            config.save(p)?;
        }
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Updates the configuration.
    pub fn update(&self, config: Config) {
        self.config.store(Arc::new(config));
    }
}

impl Default for ConfigHolder {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
