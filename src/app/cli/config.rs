//! TOML configuration file parsing and loading
//!
//! Settings start from built-in defaults, are overlaid with the
//! configuration file (the one named on the command line, or the default
//! `<config dir>/plugwatch/plugwatch.toml` if present) and finally with the
//! command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::args::Args;
use crate::core::error_handling::ContextualError;
use crate::core::version;
use crate::plugin::api::{Metadata, ProtocolSettings, RegistryConfig, TransportKind};

pub const DEFAULT_ROOT: &str = "/var/run/plugwatch/plugins";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file {} does not exist", .path.display())]
    Missing { path: PathBuf },

    #[error("cannot read configuration file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse configuration file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

impl ContextualError for ConfigError {
    fn is_user_actionable(&self) -> bool {
        true
    }

    fn user_message(&self) -> Option<String> {
        Some(self.to_string())
    }
}

/// Effective settings for one run
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub root: PathBuf,
    pub api_version: String,
    pub metadata: Metadata,
    pub transport: TransportKind,
    pub poll_interval: Duration,
    pub protocol: ProtocolSettings,
    pub once: bool,
    pub color: Option<bool>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            api_version: version::default_api_version().to_string(),
            metadata: Metadata::new(),
            transport: TransportKind::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            protocol: ProtocolSettings::default(),
            once: false,
            color: None,
            log_level: None,
            log_format: None,
            log_file: None,
        }
    }
}

impl Config {
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("plugwatch").join("plugwatch.toml"))
    }

    /// Defaults, then the configuration file, then `args`.
    pub async fn load(args: &Args) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        let path = match &args.config_file {
            Some(path) if !path.exists() => {
                return Err(ConfigError::Missing { path: path.clone() })
            }
            Some(path) => Some(path.clone()),
            None => Self::default_config_path().filter(|path| path.exists()),
        };
        if let Some(path) = path {
            let table = read_config_file(&path).await?;
            config.apply_toml_values(&table)?;
        }
        config.apply_args(args)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply TOML configuration values
    pub fn apply_toml_values(&mut self, table: &toml::Table) -> Result<(), ConfigError> {
        if let Some(root) = string_field(table, "root")? {
            self.root = PathBuf::from(root);
        }
        if let Some(value) = table.get("api-version") {
            self.api_version = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(n) => n.to_string(),
                _ => return Err(ConfigError::invalid("api-version", "expected a string or integer")),
            };
        }
        if let Some(name) = string_field(table, "transport")? {
            self.transport = parse_transport(&name)?;
        }
        if let Some(secs) = integer_field(table, "poll-interval")? {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = integer_field(table, "rpc-timeout-ms")? {
            self.protocol.rpc_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = integer_field(table, "retry-interval-ms")? {
            self.protocol.retry_interval = Duration::from_millis(ms);
        }
        if let Some(level) = string_field(table, "log-level")? {
            self.log_level = Some(level);
        }
        if let Some(format) = string_field(table, "log-format")? {
            self.log_format = Some(format);
        }
        if let Some(file) = string_field(table, "log-file")? {
            // "none" and "-" disable file logging
            self.log_file = if file.eq_ignore_ascii_case("none") || file == "-" {
                None
            } else {
                Some(PathBuf::from(file))
            };
        }
        if let Some(color) = table.get("color") {
            let color = color
                .as_bool()
                .ok_or_else(|| ConfigError::invalid("color", "expected true or false"))?;
            self.color = Some(color);
        }
        if let Some(metadata) = table.get("metadata") {
            let metadata = metadata
                .as_table()
                .ok_or_else(|| ConfigError::invalid("metadata", "expected a table"))?;
            for (key, value) in metadata {
                let value = match value {
                    toml::Value::String(s) => s.clone(),
                    toml::Value::Integer(_) | toml::Value::Float(_) | toml::Value::Boolean(_) => {
                        value.to_string()
                    }
                    _ => {
                        return Err(ConfigError::invalid(
                            &format!("metadata.{key}"),
                            "expected a scalar value",
                        ))
                    }
                };
                self.metadata.insert(key.clone(), value);
            }
        }
        Ok(())
    }

    /// Overlay values given on the command line.
    pub fn apply_args(&mut self, args: &Args) -> Result<(), ConfigError> {
        if let Some(root) = &args.root {
            self.root = root.clone();
        }
        if let Some(api_version) = &args.api_version {
            self.api_version = api_version.clone();
        }
        for (key, value) in &args.metadata {
            self.metadata.insert(key.clone(), value.clone());
        }
        if let Some(name) = &args.transport {
            self.transport = parse_transport(name)?;
        }
        if let Some(secs) = args.poll_interval {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = args.rpc_timeout_ms {
            self.protocol.rpc_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = args.retry_interval_ms {
            self.protocol.retry_interval = Duration::from_millis(ms);
        }
        self.once |= args.once;
        if let Some(color) = args.color_choice() {
            self.color = Some(color);
        }
        if let Some(level) = &args.log_level {
            self.log_level = Some(level.clone());
        }
        if let Some(format) = &args.log_format {
            self.log_format = Some(format.clone());
        }
        if let Some(file) = &args.log_file {
            self.log_file = match file.to_str() {
                Some(s) if s.eq_ignore_ascii_case("none") || s == "-" => None,
                _ => Some(file.clone()),
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::invalid("root", "must not be empty"));
        }
        if self.api_version.is_empty() {
            return Err(ConfigError::invalid("api-version", "must not be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll-interval", "must be greater than zero"));
        }
        if self.protocol.rpc_timeout.is_zero() {
            return Err(ConfigError::invalid("rpc-timeout-ms", "must be greater than zero"));
        }
        if self.protocol.retry_interval.is_zero() {
            return Err(ConfigError::invalid("retry-interval-ms", "must be greater than zero"));
        }
        if let Some(format) = &self.log_format {
            if !matches!(format.as_str(), "text" | "ext" | "json") {
                return Err(ConfigError::invalid("log-format", format!("unknown format '{format}'")));
            }
        }
        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            root: self.root.clone(),
            api_version: self.api_version.clone(),
            handshake_metadata: self.metadata.clone(),
            protocol: self.protocol,
            transport: self.transport,
        }
    }
}

async fn read_config_file(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    toml::from_str::<toml::Table>(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn string_field(table: &toml::Table, key: &str) -> Result<Option<String>, ConfigError> {
    match table.get(key) {
        None => Ok(None),
        Some(toml::Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ConfigError::invalid(key, "expected a string")),
    }
}

fn integer_field(table: &toml::Table, key: &str) -> Result<Option<u64>, ConfigError> {
    match table.get(key) {
        None => Ok(None),
        Some(toml::Value::Integer(n)) => u64::try_from(*n)
            .map(Some)
            .map_err(|_| ConfigError::invalid(key, "must not be negative")),
        Some(_) => Err(ConfigError::invalid(key, "expected an integer")),
    }
}

fn parse_transport(name: &str) -> Result<TransportKind, ConfigError> {
    TransportKind::from_name(name).ok_or_else(|| {
        ConfigError::invalid(
            "transport",
            format!("unknown transport '{}', expected one of {}", name, TransportKind::names().join(", ")),
        )
    })
}
