//! # Configuration Management
//!
//! Centralized configuration for the replication engine.
//!
//! Server and client each load a [`NetworkConfig`]. The subset of settings that
//! changes the wire format (see [`NetworkConfig::config_hash`]) must be identical
//! on both ends; a client whose hash differs is refused during the connection
//! request.
//!
//! ## Configuration Sources
//! - TOML files via [`NetworkConfig::from_file`]
//! - TOML strings via [`NetworkConfig::from_toml`]
//! - `REPLICA_*` environment variables via [`NetworkConfig::from_env`]
//! - Direct instantiation with defaults and [`NetworkConfig::default_with_overrides`]

use crate::error::{ProtocolError, Result};
use crate::utils::hash::StableHasher;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Default time a registered RPC response may stay outstanding
pub const DEFAULT_RPC_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Replication protocol settings
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Handshake and encryption settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(version) = std::env::var("REPLICA_PROTOCOL_VERSION") {
            config.protocol.protocol_version = version.parse::<u16>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid REPLICA_PROTOCOL_VERSION: {e}"))
            })?;
        }

        if let Some(val) = env_flag("REPLICA_ENABLE_ENCRYPTION") {
            config.security.enable_encryption = val;
        }

        if let Some(val) = env_flag("REPLICA_SIGN_KEY_EXCHANGE") {
            config.security.sign_key_exchange = val;
        }

        if let Ok(host) = std::env::var("REPLICA_SERVER_HOSTNAME") {
            config.security.server_hostname = host;
        }

        if let Some(val) = env_flag("REPLICA_CONNECTION_APPROVAL") {
            config.protocol.connection_approval = val;
        }

        if let Some(val) = env_flag("REPLICA_ENABLE_NETWORKED_VAR") {
            config.protocol.enable_networked_var = val;
        }

        if let Ok(timeout) = std::env::var("REPLICA_RPC_RESPONSE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.protocol.rpc_response_timeout = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Hash of every setting that changes how messages are encoded or interpreted.
    ///
    /// Logging, timeouts, hostnames and the player prefab do not take part:
    /// two peers may differ in those and still talk to each other.
    pub fn config_hash(&self) -> u64 {
        let mut hasher = StableHasher::new();
        hasher
            .write_u64(u64::from(self.protocol.protocol_version))
            .write_bool(self.protocol.spawn_mode == SpawnMode::PrefabSync)
            .write_bool(self.protocol.connection_approval)
            .write_bool(self.protocol.enable_networked_var)
            .write_bool(self.security.enable_encryption)
            .write_bool(self.security.sign_key_exchange);

        hasher.write_u64(self.protocol.channels.len() as u64);
        for channel in &self.protocol.channels {
            hasher.write_str(channel);
        }

        hasher.write_u64(self.protocol.registered_scenes.len() as u64);
        for scene in &self.protocol.registered_scenes {
            hasher.write_str(scene);
        }

        hasher.finish()
    }

    /// Whether a peer's config hash matches ours
    pub fn compare_config(&self, remote_hash: u64) -> bool {
        self.config_hash() == remote_hash
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.protocol.validate());
        errors.extend(self.security.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

/// How spawned objects identify what to instantiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// Every spawn names a prefab; scene objects are destroyed on initial sync
    PrefabSync,
    /// Spawns may refer to objects already present in the loaded scene
    SoftSync,
}

/// Replication protocol settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Wire protocol version; part of the config hash
    pub protocol_version: u16,

    /// Spawn identity mode
    pub spawn_mode: SpawnMode,

    /// Whether connection requests carry a payload for the approval hook
    pub connection_approval: bool,

    /// Whether replicated variables are synchronized
    pub enable_networked_var: bool,

    /// Whether approved clients get a player object by default
    pub create_player_prefab: bool,

    /// Prefab used for player objects when the approval does not name one
    pub player_prefab_hash: Option<u64>,

    /// Scene names in index order
    pub registered_scenes: Vec<String>,

    /// Channel names available for messages
    pub channels: Vec<String>,

    /// How long a registered RPC response may stay outstanding
    #[serde(with = "duration_serde")]
    pub rpc_response_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            spawn_mode: SpawnMode::PrefabSync,
            connection_approval: false,
            enable_networked_var: true,
            create_player_prefab: false,
            player_prefab_hash: None,
            registered_scenes: Vec::new(),
            channels: vec![
                crate::protocol::message::INTERNAL_CHANNEL.to_string(),
                String::from("RELIABLE"),
                String::from("UNRELIABLE"),
            ],
            rpc_response_timeout: DEFAULT_RPC_RESPONSE_TIMEOUT,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.protocol_version == 0 {
            errors.push("Protocol version must be greater than 0".to_string());
        }

        if self.create_player_prefab && self.player_prefab_hash.is_none() {
            errors.push(
                "player_prefab_hash must be set when create_player_prefab is true".to_string(),
            );
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.is_empty() {
                errors.push("Channel names cannot be empty".to_string());
            } else if !seen.insert(channel.as_str()) {
                errors.push(format!("Duplicate channel name: '{channel}'"));
            }
        }

        if !self
            .channels
            .iter()
            .any(|c| c == crate::protocol::message::INTERNAL_CHANNEL)
        {
            errors.push(format!(
                "Channel list must contain the '{}' channel",
                crate::protocol::message::INTERNAL_CHANNEL
            ));
        }

        let mut scenes = HashSet::new();
        for scene in &self.registered_scenes {
            if !scenes.insert(scene.as_str()) {
                errors.push(format!("Scene registered twice: '{scene}'"));
            }
        }

        if self.rpc_response_timeout.as_millis() < 100 {
            errors.push("RPC response timeout too short (minimum: 100ms)".to_string());
        } else if self.rpc_response_timeout.as_secs() > 600 {
            errors.push("RPC response timeout too long (maximum: 600s)".to_string());
        }

        errors
    }
}

/// Handshake and encryption settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Run the key exchange and seal flagged messages
    pub enable_encryption: bool,

    /// Server signs its key exchange value; client verifies it
    pub sign_key_exchange: bool,

    /// Host identity the client expects in the server certificate
    pub server_hostname: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_encryption: false,
            sign_key_exchange: false,
            server_hostname: String::from("localhost"),
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.sign_key_exchange && !self.enable_encryption {
            errors.push("sign_key_exchange requires enable_encryption".to_string());
        }

        if self.sign_key_exchange && self.server_hostname.is_empty() {
            errors.push("server_hostname must be set when sign_key_exchange is true".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for console logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("replica-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            match self.log_file_path {
                Some(ref path) => {
                    if let Some(parent) = Path::new(path).parent() {
                        if !parent.as_os_str().is_empty() && !parent.exists() {
                            errors.push(format!(
                                "Log file directory does not exist: {}",
                                parent.display()
                            ));
                        }
                    }
                }
                None => errors
                    .push("log_file_path must be specified when log_to_file is true".to_string()),
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Duration as integer milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// tracing::Level as a lowercase string
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&level.as_str().to_lowercase())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
