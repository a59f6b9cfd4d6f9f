//! Configuration loading
//!
//! Sources are applied in the order they were added, later ones winning:
//! 1. Default values
//! 2. Configuration files or in-memory TOML
//! 3. Environment variables

use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use skein_switch::{EngineConfig, NodeId, NodeInfo};
use skein_telemetry::LogConfig;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration source type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Load from a file
    File(PathBuf),
    /// Load from environment variables
    Env,
    /// Use default values
    Default,
    /// Load from in-memory string
    Memory(String),
}

/// Identity of this agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id as registered in the metadata store
    pub id: u64,
    /// Site or rack the node lives in
    pub location: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            location: "default".to_string(),
        }
    }
}

/// A peer agent this node may talk to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: u64,
    /// `host:port` of the peer's agent server
    pub address: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

impl PeerConfig {
    pub fn to_node_info(&self) -> NodeInfo {
        let info = NodeInfo::new(NodeId(self.id), self.address.clone(), self.location.clone());
        match self.delay_ms {
            Some(delay) => info.with_delay(delay),
            None => info,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bind address
    pub bind_address: String,
    /// Agent server port
    pub port: u16,
    /// Known peers
    pub peers: Vec<PeerConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 7400,
            peers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the local blob store
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir: home.join(".skein/blobs"),
        }
    }
}

/// Distributed lock settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long an acquire waits for conflicting locks to go away
    pub acquire_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
        }
    }
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Top-level skein agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkeinConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub lock: LockConfig,
    pub log: LogConfig,
}

impl SkeinConfig {
    pub fn node_id(&self) -> NodeId {
        NodeId(self.node.id)
    }

    /// Peers as directory entries
    pub fn peer_nodes(&self) -> Vec<NodeInfo> {
        self.network.peers.iter().map(PeerConfig::to_node_info).collect()
    }
}

/// Configuration loader
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: vec![ConfigSource::Default],
            env_prefix: None,
        }
    }

    /// Add a file source
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.sources
            .push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add an in-memory TOML source
    pub fn with_memory(mut self, toml: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Memory(toml.into()));
        self
    }

    /// Add environment variable source with prefix
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.sources.push(ConfigSource::Env);
        self
    }

    /// Load configuration from all sources
    pub fn load(&self) -> Result<SkeinConfig> {
        let mut config = SkeinConfig::default();

        for source in &self.sources {
            match source {
                ConfigSource::Default => {}
                ConfigSource::File(path) => {
                    let content = std::fs::read_to_string(path)?;
                    config = Self::parse(&content)?;
                }
                ConfigSource::Memory(content) => {
                    config = Self::parse(content)?;
                }
                ConfigSource::Env => {
                    if let Some(prefix) = &self.env_prefix {
                        config = Self::apply_env_overrides(config, prefix)?;
                    }
                }
            }
        }

        config.storage.data_dir = Self::expand_path(&config.storage.data_dir);
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn load_from_str(toml: &str) -> Result<SkeinConfig> {
        Self::new().with_memory(toml).load()
    }

    fn parse(content: &str) -> Result<SkeinConfig> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut config: SkeinConfig, prefix: &str) -> Result<SkeinConfig> {
        if let Some(val) = env_parse(prefix, "NODE_ID")? {
            config.node.id = val;
        }
        if let Some(val) = env_string(prefix, "NODE_LOCATION") {
            config.node.location = val;
        }

        if let Some(val) = env_string(prefix, "NETWORK_BIND_ADDRESS") {
            config.network.bind_address = val;
        }
        if let Some(val) = env_parse(prefix, "NETWORK_PORT")? {
            config.network.port = val;
        }

        if let Some(val) = env_string(prefix, "STORAGE_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(val);
        }

        if let Some(val) = env_parse(prefix, "ENGINE_FIND_SWITCH_TIMEOUT_MS")? {
            config.engine.find_switch_timeout_ms = val;
        }
        if let Some(val) = env_parse(prefix, "ENGINE_BIND_TIMEOUT_MS")? {
            config.engine.bind_timeout_ms = val;
        }
        if let Some(val) = env_parse(prefix, "ENGINE_PIPE_DEPTH")? {
            config.engine.pipe_depth = val;
        }
        if let Some(val) = env_parse(prefix, "ENGINE_COPY_BUFFER_SIZE")? {
            config.engine.copy_buffer_size = val;
        }

        if let Some(val) = env_parse(prefix, "LOCK_ACQUIRE_TIMEOUT_MS")? {
            config.lock.acquire_timeout_ms = val;
        }

        if let Some(val) = env_string(prefix, "LOG_LEVEL") {
            config.log.level = val.parse().map_err(|e| invalid("log.level", e))?;
        }
        if let Some(val) = env_string(prefix, "LOG_FORMAT") {
            config.log.format = val.parse().map_err(|e| invalid("log.format", e))?;
        }
        if let Some(val) = env_string(prefix, "LOG_OUTPUT") {
            config.log.output = val.parse().map_err(|e| invalid("log.output", e))?;
        }

        Ok(config)
    }

    /// Expand path with tilde
    fn expand_path(path: &Path) -> PathBuf {
        if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        path.to_path_buf()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_string(prefix: &str, key: &str) -> Option<String> {
    std::env::var(format!("{prefix}_{key}")).ok()
}

fn env_parse<T: FromStr>(prefix: &str, key: &str) -> Result<Option<T>> {
    match env_string(prefix, key) {
        Some(val) => val
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvVar(format!("Invalid {prefix}_{key} value: {val}"))),
        None => Ok(None),
    }
}

fn invalid(field: &str, e: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_telemetry::{LogFormat, LogLevel, LogOutput};
    use std::io::Write;
    use tempfile::NamedTempFile;

    // Each test that touches the environment uses its own prefix so tests
    // running in parallel never see each other's variables.

    const SAMPLE: &str = r#"
        [node]
        id = 7
        location = "rack-a"

        [network]
        port = 7501

        [[network.peers]]
        id = 8
        address = "10.0.0.8:7400"
        location = "rack-a"

        [[network.peers]]
        id = 9
        address = "10.0.0.9:7400"
        delay_ms = 12

        [engine]
        pipe_depth = 4

        [log]
        level = "debug"
        format = "json"
    "#;

    #[test]
    fn test_defaults() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config.node.id, 1);
        assert_eq!(config.network.port, 7400);
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.lock.acquire_timeout(), Duration::from_secs(30));
        assert!(config.storage.data_dir.ends_with(".skein/blobs"));
    }

    #[test]
    fn test_load_from_str() {
        let config = ConfigLoader::load_from_str(SAMPLE).unwrap();
        assert_eq!(config.node_id(), NodeId(7));
        assert_eq!(config.network.listen_address(), "0.0.0.0:7501");
        assert_eq!(config.engine.pipe_depth, 4);
        // unspecified engine fields keep their defaults
        assert_eq!(config.engine.bind_timeout_ms, 30_000);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.log.format, LogFormat::Json);

        let peers = config.peer_nodes();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].location, "rack-a");
        assert_eq!(peers[1].delay_ms, Some(12));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = ConfigLoader::new().with_file(file.path()).load().unwrap();
        assert_eq!(config.node.location, "rack-a");
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigLoader::new()
            .with_file("/nonexistent/skein.toml")
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_parse_error() {
        let err = ConfigLoader::load_from_str("[node\nid = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides_file() {
        unsafe {
            std::env::set_var("SKEINENV_NETWORK_PORT", "7999");
            std::env::set_var("SKEINENV_ENGINE_BIND_TIMEOUT_MS", "1500");
            std::env::set_var("SKEINENV_LOG_OUTPUT", "stderr");
        }
        let config = ConfigLoader::new()
            .with_memory(SAMPLE)
            .with_env_prefix("SKEINENV")
            .load()
            .unwrap();
        unsafe {
            std::env::remove_var("SKEINENV_NETWORK_PORT");
            std::env::remove_var("SKEINENV_ENGINE_BIND_TIMEOUT_MS");
            std::env::remove_var("SKEINENV_LOG_OUTPUT");
        }

        assert_eq!(config.network.port, 7999);
        assert_eq!(config.engine.bind_timeout_ms, 1500);
        assert_eq!(config.log.output, LogOutput::Stderr);
        assert_eq!(config.node.id, 7);
    }

    #[test]
    fn test_env_bad_value() {
        unsafe {
            std::env::set_var("SKEINBAD_NETWORK_PORT", "not-a-port");
        }
        let result = ConfigLoader::new().with_env_prefix("SKEINBAD").load();
        unsafe {
            std::env::remove_var("SKEINBAD_NETWORK_PORT");
        }
        assert!(matches!(result, Err(ConfigError::EnvVar(_))));
    }

    #[test]
    fn test_tilde_expansion() {
        let config = ConfigLoader::load_from_str("[storage]\ndata_dir = \"~/blobs\"").unwrap();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.storage.data_dir, home.join("blobs"));
        }
    }
}
