//! Session configuration.
//!
//! Configuration is TOML with three sections:
//!
//! ```toml
//! [device]
//! name = "Front door"
//! address = "AA:BB:CC:DD:EE:FF"
//! model = "sesame5"
//!
//! [connection]
//! connect_timeout_secs = 15
//!
//! [reconnect]
//! initial_delay_ms = 1000
//! ```
//!
//! Every section and field has a default except `device.address`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sesame_types::{DeviceAddress, DeviceModel};

use crate::reconnect::ReconnectOptions;
use crate::session::{DEFAULT_COMMAND_TAG, SessionOptions};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectConfig,
}

impl Config {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        // Create parent directories if needed
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.device.validate());
        errors.extend(self.connection.validate());
        errors.extend(self.reconnect.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// The configured lock address.
    pub fn address(&self) -> Result<DeviceAddress, ConfigError> {
        self.device.address.parse().map_err(|e: sesame_types::ParseError| {
            ConfigError::Validation(vec![ValidationError {
                field: "device.address".to_string(),
                message: e.to_string(),
            }])
        })
    }

    /// Session options described by this configuration.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            connect_timeout: Duration::from_secs(self.connection.connect_timeout_secs),
            initial_status_timeout: Duration::from_secs(self.connection.initial_status_timeout_secs),
            command_status_timeout: Duration::from_secs(self.connection.command_status_timeout_secs),
            event_capacity: self.connection.event_capacity,
            command_tag: self.device.command_tag.clone(),
            reconnect: self.reconnect.to_options(),
        }
    }
}

/// The lock to manage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Display name.
    pub name: Option<String>,
    /// Bluetooth address.
    pub address: String,
    /// Lock model.
    pub model: DeviceModel,
    /// Device identifier for rediscovery under a transient address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_uuid: Option<Uuid>,
    /// Actor label sent with lock and unlock commands.
    pub command_tag: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: None,
            address: String::new(),
            model: DeviceModel::Sesame5,
            device_uuid: None,
            command_tag: DEFAULT_COMMAND_TAG.to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.address.trim().is_empty() {
            errors.push(ValidationError {
                field: "device.address".to_string(),
                message: "device address cannot be empty".to_string(),
            });
        } else if let Err(e) = self.address.parse::<DeviceAddress>() {
            errors.push(ValidationError {
                field: "device.address".to_string(),
                message: e.to_string(),
            });
        }

        if self.command_tag.is_empty() {
            errors.push(ValidationError {
                field: "device.command_tag".to_string(),
                message: "command tag cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Connection timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_secs: u64,
    pub initial_status_timeout_secs: u64,
    pub command_status_timeout_secs: u64,
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            initial_status_timeout_secs: 10,
            command_status_timeout_secs: 10,
            event_capacity: 64,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (field, value) in [
            ("connection.connect_timeout_secs", self.connect_timeout_secs),
            (
                "connection.initial_status_timeout_secs",
                self.initial_status_timeout_secs,
            ),
            (
                "connection.command_status_timeout_secs",
                self.command_status_timeout_secs,
            ),
        ] {
            if value == 0 {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: "timeout must be greater than 0".to_string(),
                });
            }
        }
        if self.event_capacity == 0 {
            errors.push(ValidationError {
                field: "connection.event_capacity".to_string(),
                message: "event capacity must be greater than 0".to_string(),
            });
        }
        errors
    }
}

/// Backoff after failed connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub exponential_backoff: bool,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            exponential_backoff: true,
            jitter: false,
        }
    }
}

impl ReconnectConfig {
    pub fn to_options(&self) -> ReconnectOptions {
        ReconnectOptions {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            use_exponential_backoff: self.exponential_backoff,
            jitter: self.jitter,
        }
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.initial_delay_ms == 0 {
            errors.push(ValidationError {
                field: "reconnect.initial_delay_ms".to_string(),
                message: "initial delay must be greater than 0".to_string(),
            });
        }
        if self.max_delay_ms < self.initial_delay_ms {
            errors.push(ValidationError {
                field: "reconnect.max_delay_ms".to_string(),
                message: format!(
                    "max delay ({}) must be at least the initial delay ({})",
                    self.max_delay_ms, self.initial_delay_ms
                ),
            });
        }
        if !(self.backoff_multiplier >= 1.0) {
            errors.push(ValidationError {
                field: "reconnect.backoff_multiplier".to_string(),
                message: format!("must be >= 1.0, got {}", self.backoff_multiplier),
            });
        }
        errors
    }
}

/// Errors that can occur when loading or saving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `device.address`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [device]
        name = "Front door"
        address = "aa:bb:cc:dd:ee:ff"
        model = "sesame5_pro"
        device_uuid = "01234567-89ab-cdef-1032-547698badcfe"

        [connection]
        connect_timeout_secs = 20

        [reconnect]
        initial_delay_ms = 500
        jitter = true
    "#;

    fn fields(err: ConfigError) -> Vec<String> {
        match err {
            ConfigError::Validation(errors) => errors.into_iter().map(|e| e.field).collect(),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.connection.connect_timeout_secs, 15);
        assert_eq!(config.connection.initial_status_timeout_secs, 10);
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
        assert_eq!(config.device.command_tag, "sesame-core");
        assert_eq!(config.device.model, DeviceModel::Sesame5);
    }

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.device.name.as_deref(), Some("Front door"));
        assert_eq!(config.device.model, DeviceModel::Sesame5Pro);
        assert!(config.device.device_uuid.is_some());
        assert_eq!(config.connection.connect_timeout_secs, 20);
        // Unspecified fields keep their defaults.
        assert_eq!(config.connection.command_status_timeout_secs, 10);
        assert!(config.reconnect.jitter);
        assert!(config.validate().is_ok());
        assert_eq!(config.address().unwrap().to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_session_options() {
        let options = Config::parse(SAMPLE).unwrap().session_options();
        assert_eq!(options.connect_timeout, Duration::from_secs(20));
        assert_eq!(options.reconnect.initial_delay, Duration::from_millis(500));
        assert_eq!(options.command_tag, "sesame-core");
    }

    #[test]
    fn test_validate_missing_address() {
        let err = Config::default().validate().unwrap_err();
        assert_eq!(fields(err), vec!["device.address"]);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.device.address = "not-a-mac".to_string();
        config.connection.connect_timeout_secs = 0;
        config.reconnect.backoff_multiplier = 0.5;
        config.reconnect.max_delay_ms = 10;

        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("device.address"));
        assert_eq!(
            fields(err),
            vec![
                "device.address",
                "connection.connect_timeout_secs",
                "reconnect.max_delay_ms",
                "reconnect.backoff_multiplier",
            ]
        );
    }

    #[test]
    fn test_parse_error() {
        assert!(Config::parse("[device]\naddress = 5").is_err());
        assert!(Config::parse("[device]\nmodel = \"bot2\"").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("sesame-core-{}", Uuid::new_v4()));
        let path = dir.join("nested").join("sesame.toml");

        let config = Config::parse(SAMPLE).unwrap();
        config.save(&path).unwrap();
        let loaded = Config::load_validated(&path).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/sesame.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
