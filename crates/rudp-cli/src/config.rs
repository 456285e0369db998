//! Configuration file for the rudp CLI.

use rudp_core::{ProtocolConfig, Role};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// rudp configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Network configuration
    pub network: NetworkConfig,
    /// Protocol timing and limits
    pub protocol: ProtocolSettings,
    /// Resource storage
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address `serve` binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Responder address for `fetch`, `push` and `list`
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Socket send/receive buffer size in bytes
    #[serde(default = "default_socket_buffer")]
    pub socket_buffer: usize,
}

/// Protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Data direction when serving
    #[serde(default)]
    pub role: Role,
    /// ACK wait before retransmitting, in milliseconds
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Sends per unit before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Handshake reply wait, in milliseconds
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Idle session eviction threshold, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Idle sweep period, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Session key lifetime, in seconds
    #[serde(default = "default_key_lifetime_secs")]
    pub key_lifetime_secs: u64,
    /// Largest datagram to emit
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
    /// Encrypt every session
    #[serde(default)]
    pub require_encryption: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory served from and received into
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_bind_addr() -> String {
    "0.0.0.0:22000".to_string()
}

fn default_server_addr() -> String {
    "127.0.0.1:22000".to_string()
}

fn default_socket_buffer() -> usize {
    rudp_transport::udp_async::DEFAULT_SOCKET_BUFFER
}

fn default_ack_timeout_ms() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_key_lifetime_secs() -> u64 {
    300
}

fn default_max_datagram_size() -> usize {
    rudp_transport::MAX_UDP_PAYLOAD
}

fn default_storage_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("rudp")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            server_addr: default_server_addr(),
            socket_buffer: default_socket_buffer(),
        }
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            role: Role::default(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_attempts: default_max_attempts(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            key_lifetime_secs: default_key_lifetime_secs(),
            max_datagram_size: default_max_datagram_size(),
            require_encryption: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("rudp/config.toml")
    }

    /// Load the default config file, or defaults if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse bind address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_bind_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.bind_addr.parse()?)
    }

    /// Parse server address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_server_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.server_addr.parse()?)
    }

    /// Protocol settings in library form.
    #[must_use]
    pub fn protocol_config(&self) -> ProtocolConfig {
        let p = &self.protocol;
        ProtocolConfig {
            role: p.role,
            ack_timeout: Duration::from_millis(p.ack_timeout_ms),
            max_attempts: p.max_attempts,
            handshake_timeout: Duration::from_millis(p.handshake_timeout_ms),
            idle_timeout: Duration::from_secs(p.idle_timeout_secs),
            sweep_interval: Duration::from_secs(p.sweep_interval_secs),
            key_lifetime: Duration::from_secs(p.key_lifetime_secs),
            max_datagram_size: p.max_datagram_size,
            require_encryption: p.require_encryption,
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_bind_addr()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.network.bind_addr, e))?;
        self.parse_server_addr().map_err(|e| {
            anyhow::anyhow!("Invalid server address '{}': {}", self.network.server_addr, e)
        })?;

        if self.network.socket_buffer == 0 {
            anyhow::bail!("Socket buffer size must be non-zero");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        if self.storage.dir.as_os_str().is_empty() {
            anyhow::bail!("Storage directory must not be empty");
        }

        self.protocol_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid [protocol] settings: {}", e))?;

        Ok(())
    }
}
