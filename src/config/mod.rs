//! Configuration management for the data layer
//!
//! This module handles loading, parsing, and managing configuration from various sources:
//! - Configuration files (TOML format)
//! - Environment variables
//! - Command-line arguments
//!
//! Configuration precedence (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file
//! 4. Default values

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "FHIR_DATALAYER_";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Partitioning configuration
    #[serde(default)]
    pub partitioning: PartitioningConfig,

    /// Query defaults applied to every partition cursor
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Connection-related configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// MongoDB connection URI
    #[serde(default = "default_uri")]
    pub uri: String,

    /// Database holding clinical resources
    #[serde(default = "default_db_name")]
    pub db_name: String,

    /// Database holding AuditEvent partitions
    #[serde(default = "default_audit_db_name")]
    pub audit_db_name: String,

    /// Application name reported to the server
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Server selection timeout in seconds
    #[serde(default = "default_server_selection_timeout")]
    pub server_selection_timeout: u64,

    /// Maximum pool size
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: u32,

    /// Minimum pool size
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: u32,

    /// Connection idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

/// Which resource types are stored across several collections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitioningConfig {
    /// Partitioned resource types; `all` partitions every type
    #[serde(default = "default_partition_resources")]
    pub partition_resources: Vec<String>,

    /// Hours before the partition cache is reloaded from the database
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: i64,
}

/// Defaults applied to each query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Server-side time limit per partition cursor, in milliseconds
    #[serde(default)]
    pub max_time_ms: Option<u64>,

    /// Documents fetched per round trip
    #[serde(default)]
    pub batch_size: Option<u32>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// Enable timestamps in logs
    #[serde(default = "default_log_timestamps")]
    pub timestamps: bool,
}

/// Log level options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Metrics configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder at startup
    #[serde(default)]
    pub enabled: bool,
}

// Default value functions
fn default_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_db_name() -> String {
    "fhir".to_string()
}

fn default_audit_db_name() -> String {
    "audit-event".to_string()
}

fn default_app_name() -> String {
    "fhir".to_string()
}

fn default_timeout() -> u64 {
    360
}

fn default_server_selection_timeout() -> u64 {
    30
}

fn default_max_pool_size() -> u32 {
    100
}

fn default_min_pool_size() -> u32 {
    10
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_partition_resources() -> Vec<String> {
    vec!["AuditEvent".to_string()]
}

fn default_cache_ttl_hours() -> i64 {
    24
}

fn default_log_level() -> LogLevel {
    LogLevel::Warn
}

fn default_log_timestamps() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            db_name: default_db_name(),
            audit_db_name: default_audit_db_name(),
            app_name: default_app_name(),
            timeout: default_timeout(),
            server_selection_timeout: default_server_selection_timeout(),
            max_pool_size: default_max_pool_size(),
            min_pool_size: default_min_pool_size(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for PartitioningConfig {
    fn default() -> Self {
        Self {
            partition_resources: default_partition_resources(),
            cache_ttl_hours: default_cache_ttl_hours(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            timestamps: default_log_timestamps(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file (TOML format)
    ///
    /// # Returns
    /// * `Result<Config>` - Loaded configuration or error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| ConfigError::InvalidFormat(e.to_string()).into())
    }

    /// Load configuration from an explicit path or the default location
    ///
    /// An explicit path must exist. A missing default file yields the default configuration.
    pub fn load_from_file(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from file and environment with proper precedence
    ///
    /// # Returns
    /// * `Result<Config>` - Merged configuration or error
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values read through `lookup` (keys include [`ENV_PREFIX`]).
    ///
    /// Example: `FHIR_DATALAYER_MONGO_URL=mongodb://db:27017`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(uri) = var("MONGO_URL") {
            self.connection.uri = uri;
        }
        if let Some(db) = var("MONGO_DB_NAME") {
            self.connection.db_name = db;
        }
        if let Some(db) = var("AUDIT_EVENT_MONGO_DB_NAME") {
            self.connection.audit_db_name = db;
        }
        if let Some(resources) = var("PARTITION_RESOURCES") {
            self.partitioning.partition_resources = resources
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(value) = var("MAX_TIME_MS") {
            let millis = value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                field: "query.max_time_ms".to_string(),
                value: value.clone(),
            })?;
            self.query.max_time_ms = Some(millis);
        }
        if let Some(value) = var("LOG_LEVEL") {
            self.logging.level = LogLevel::parse(&value).ok_or(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                value,
            })?;
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// # Returns
    /// * `PathBuf` - Path to default configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fhir-datalayer")
            .join("config.toml")
    }

    /// Save configuration to a file
    ///
    /// # Arguments
    /// * `path` - Path where to save the configuration
    ///
    /// # Returns
    /// * `Result<()>` - Success or error
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidFormat(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate the configuration
    ///
    /// # Returns
    /// * `Result<()>` - Ok if valid, error otherwise
    pub fn validate(&self) -> Result<()> {
        self.connection.validate_uri()?;

        if self.connection.db_name.trim().is_empty() {
            return Err(invalid("connection.db_name", &self.connection.db_name));
        }
        if self.connection.audit_db_name.trim().is_empty() {
            return Err(invalid(
                "connection.audit_db_name",
                &self.connection.audit_db_name,
            ));
        }
        if self.connection.min_pool_size > self.connection.max_pool_size {
            return Err(invalid(
                "connection.min_pool_size",
                &self.connection.min_pool_size.to_string(),
            ));
        }
        if self.partitioning.cache_ttl_hours <= 0 {
            return Err(invalid(
                "partitioning.cache_ttl_hours",
                &self.partitioning.cache_ttl_hours.to_string(),
            ));
        }
        if let Some(resource) = self
            .partitioning
            .partition_resources
            .iter()
            .find(|r| r.ends_with("4_0_0"))
        {
            return Err(invalid("partitioning.partition_resources", resource));
        }
        if self.query.batch_size == Some(0) {
            return Err(invalid("query.batch_size", "0"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str) -> crate::error::DataLayerError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

impl ConnectionConfig {
    /// Check the URI scheme
    ///
    /// # Returns
    /// * `Result<()>` - Ok if URI is valid, error otherwise
    pub fn validate_uri(&self) -> Result<()> {
        if self.uri.starts_with("mongodb://") || self.uri.starts_with("mongodb+srv://") {
            Ok(())
        } else {
            Err(invalid("connection.uri", &self.uri))
        }
    }
}

impl LogLevel {
    /// Parse a level name, case-insensitively
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.uri, "mongodb://localhost:27017");
        assert_eq!(config.connection.db_name, "fhir");
        assert_eq!(config.partitioning.partition_resources, vec!["AuditEvent"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            db_name = "clinical"

            [query]
            max_time_ms = 5000
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.db_name, "clinical");
        assert_eq!(config.connection.uri, "mongodb://localhost:27017");
        assert_eq!(config.query.max_time_ms, Some(5000));
        assert_eq!(config.logging.level, LogLevel::Warn);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.partitioning.partition_resources = vec!["all".to_string()];
        config.query.batch_size = Some(500);
        config.save(&path).unwrap();

        let reloaded = Config::from_file(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load_from_file(Some(&dir.path().join("missing.toml")));
        assert!(matches!(
            result,
            Err(crate::error::DataLayerError::Config(ConfigError::FileNotFound(_)))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("FHIR_DATALAYER_MONGO_URL", "mongodb://db:27017"),
            ("FHIR_DATALAYER_PARTITION_RESOURCES", "AuditEvent, Observation,"),
            ("FHIR_DATALAYER_MAX_TIME_MS", "1500"),
            ("FHIR_DATALAYER_LOG_LEVEL", "DEBUG"),
        ]);
        let mut config = Config::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.connection.uri, "mongodb://db:27017");
        assert_eq!(
            config.partitioning.partition_resources,
            vec!["AuditEvent", "Observation"]
        );
        assert_eq!(config.query.max_time_ms, Some(1500));
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_env_rejects_bad_number() {
        let mut config = Config::default();
        let result = config.apply_env(|key| {
            (key == "FHIR_DATALAYER_MAX_TIME_MS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.connection.uri = "http://localhost".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.partitioning.partition_resources = vec!["Patient_4_0_0".to_string()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.connection.min_pool_size = 500;
        assert!(config.validate().is_err());
    }
}
