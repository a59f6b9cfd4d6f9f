//! Configuration validation for skein agents

use crate::config::{LockConfig, NetworkConfig, SkeinConfig, StorageConfig};
use crate::{ConfigError, Result};
use skein_switch::EngineConfig;
use skein_telemetry::{LogConfig, LogOutput};
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

/// Result of configuration validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Problems that prevent the configuration from being used
    pub errors: Vec<ValidationError>,
    /// Non-blocking remarks
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Fold the errors into one `ConfigError::Validation`
    pub fn into_result(self) -> Result<Vec<ValidationWarning>> {
        if self.errors.is_empty() {
            return Ok(self.warnings);
        }
        let message = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(ConfigError::Validation(message))
    }
}

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub code: ErrorCode,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.code, self.field, self.message)
    }
}

/// Validation warning details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl ValidationWarning {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(
        field: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[WARNING] {}: {}", self.field, self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (Suggestion: {s})")?;
        }
        Ok(())
    }
}

/// Error code classifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A required field is missing or empty
    Required,
    /// A value is outside the acceptable range
    OutOfRange,
    /// A value has an invalid format
    InvalidFormat,
    /// A path cannot be used
    PathNotFound,
    /// Values conflict with each other
    Conflict,
}

/// Configuration validator
#[derive(Debug, Default)]
pub struct Validator {
    strict_mode: bool,
}

impl Validator {
    #[must_use]
    pub const fn new() -> Self {
        Self { strict_mode: false }
    }

    /// Strict mode adds warnings for settings that work but look unintended
    #[must_use]
    pub const fn with_strict_mode(mut self, enabled: bool) -> Self {
        self.strict_mode = enabled;
        self
    }

    #[must_use]
    pub fn validate(&self, config: &SkeinConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if config.node.location.trim().is_empty() {
            result.add_error(ValidationError::new(
                "node.location",
                "Location must not be empty",
                ErrorCode::Required,
            ));
        }
        result.merge(self.validate_network(config.node.id, &config.network));
        result.merge(self.validate_storage(&config.storage));
        result.merge(self.validate_engine(&config.engine));
        result.merge(self.validate_lock(&config.lock));
        result.merge(self.validate_log(&config.log));
        result
    }

    #[must_use]
    pub fn validate_network(&self, node_id: u64, config: &NetworkConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if config.bind_address.parse::<IpAddr>().is_err() {
            result.add_error(ValidationError::new(
                "network.bind_address",
                format!("Not an IP address: {}", config.bind_address),
                ErrorCode::InvalidFormat,
            ));
        }
        if config.port == 0 {
            result.add_warning(ValidationWarning::with_suggestion(
                "network.port",
                "Port 0 binds a random port",
                "Peers cannot find this agent unless the port is fixed",
            ));
        } else if self.strict_mode && config.port <= 1024 {
            result.add_warning(ValidationWarning::new(
                "network.port",
                format!("Port {} is privileged", config.port),
            ));
        }

        let mut seen = HashSet::new();
        for (i, peer) in config.peers.iter().enumerate() {
            let field = format!("network.peers[{i}]");
            if peer.id == node_id {
                result.add_error(ValidationError::new(
                    &field,
                    format!("Peer id {} is this node's own id", peer.id),
                    ErrorCode::Conflict,
                ));
            }
            if !seen.insert(peer.id) {
                result.add_error(ValidationError::new(
                    &field,
                    format!("Duplicate peer id {}", peer.id),
                    ErrorCode::Conflict,
                ));
            }
            if peer.address.trim().is_empty() {
                result.add_error(ValidationError::new(
                    format!("{field}.address"),
                    "Peer address must not be empty",
                    ErrorCode::Required,
                ));
            } else if !peer.address.contains(':') {
                result.add_error(ValidationError::new(
                    format!("{field}.address"),
                    format!("Expected host:port, got {}", peer.address),
                    ErrorCode::InvalidFormat,
                ));
            }
        }
        result
    }

    #[must_use]
    pub fn validate_storage(&self, config: &StorageConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if config.data_dir.as_os_str().is_empty() {
            result.add_error(ValidationError::new(
                "storage.data_dir",
                "Data directory must be set",
                ErrorCode::Required,
            ));
        } else if config.data_dir.is_file() {
            result.add_error(ValidationError::new(
                "storage.data_dir",
                format!("Not a directory: {}", config.data_dir.display()),
                ErrorCode::PathNotFound,
            ));
        } else if !config.data_dir.exists() {
            result.add_warning(ValidationWarning::with_suggestion(
                "storage.data_dir",
                format!("Data directory does not exist: {}", config.data_dir.display()),
                "Directory will be created on first use",
            ));
        }
        result
    }

    #[must_use]
    pub fn validate_engine(&self, config: &EngineConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if let Err(e) = config.validate() {
            result.add_error(ValidationError::new(
                "engine",
                e.to_string(),
                ErrorCode::OutOfRange,
            ));
        }
        if config.bind_timeout_ms > config.find_switch_timeout_ms.saturating_mul(10) {
            result.add_warning(ValidationWarning::new(
                "engine.bind_timeout_ms",
                "Bind timeout is much longer than the find-switch timeout",
            ));
        }
        if self.strict_mode && config.copy_buffer_size < 4096 {
            result.add_warning(ValidationWarning::with_suggestion(
                "engine.copy_buffer_size",
                format!("Small copy buffer: {} bytes", config.copy_buffer_size),
                "Use at least 4 KiB to keep frame overhead low",
            ));
        }
        result
    }

    #[must_use]
    pub fn validate_lock(&self, config: &LockConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        if config.acquire_timeout_ms == 0 {
            result.add_error(ValidationError::new(
                "lock.acquire_timeout_ms",
                "Acquire timeout must be greater than 0",
                ErrorCode::OutOfRange,
            ));
        }
        result
    }

    #[must_use]
    pub fn validate_log(&self, config: &LogConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        if let LogOutput::File(path) = &config.output {
            if path.file_name().is_none() {
                result.add_error(ValidationError::new(
                    "log.output",
                    format!("Log path has no file name: {}", path.display()),
                    ErrorCode::InvalidFormat,
                ));
            } else if path.parent().is_some_and(|p| !p.as_os_str().is_empty() && !p.exists()) {
                result.add_warning(ValidationWarning::new(
                    "log.output",
                    format!("Log directory will be created: {}", path.display()),
                ));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use std::path::PathBuf;

    fn valid_config(dir: &std::path::Path) -> SkeinConfig {
        let mut config = SkeinConfig::default();
        config.storage.data_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn test_default_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let result = Validator::new().validate(&valid_config(dir.path()));
        assert!(result.is_valid(), "{:?}", result.errors);
        assert!(result.into_result().is_ok());
    }

    #[test]
    fn test_peer_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path());
        let peer = |id: u64, address: &str| PeerConfig {
            id,
            address: address.to_string(),
            location: String::new(),
            delay_ms: None,
        };
        config.network.peers = vec![
            peer(1, "10.0.0.1:7400"),
            peer(2, "10.0.0.2:7400"),
            peer(2, "10.0.0.3:7400"),
            peer(3, "no-port"),
        ];

        let result = Validator::new().validate(&config);
        let codes: Vec<_> = result.errors.iter().map(|e| e.code).collect();
        assert_eq!(
            codes,
            vec![ErrorCode::Conflict, ErrorCode::Conflict, ErrorCode::InvalidFormat]
        );
    }

    #[test]
    fn test_engine_and_lock_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(dir.path());
        config.engine.pipe_depth = 0;
        config.lock.acquire_timeout_ms = 0;
        config.network.bind_address = "not-an-ip".to_string();

        let result = Validator::new().validate(&config);
        let fields: Vec<_> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"engine"));
        assert!(fields.contains(&"lock.acquire_timeout_ms"));
        assert!(fields.contains(&"network.bind_address"));
        assert!(matches!(result.into_result(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = valid_config(&dir.path().join("not-yet"));
        config.network.port = 0;
        config.engine.copy_buffer_size = 1024;
        config.log.output = LogOutput::File(PathBuf::from("/nonexistent-skein-dir/agent.log"));

        let result = Validator::new().with_strict_mode(true).validate(&config);
        assert!(result.is_valid());
        let fields: Vec<_> = result.warnings.iter().map(|w| w.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "network.port",
                "storage.data_dir",
                "engine.copy_buffer_size",
                "log.output"
            ]
        );
        assert!(result.warnings[1].to_string().contains("Suggestion"));
    }
}
