//! Server configuration
//!
//! Loaded from an optional TOML file; command line flags override it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Default connection timeout (5 minutes from open)
pub const DEFAULT_TIMEOUT_SECS: u64 = 5 * 60;

/// Default per-connection output buffer, in frames
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default largest encoded message (64 KiB)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Per-connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Seconds a stream may stay open
    pub timeout_secs: u64,
    /// Frames buffered per connection before it counts as a failed write
    pub channel_capacity: usize,
    /// Largest encoded message accepted for broadcast
    pub max_message_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl ConnectionConfig {
    /// Connection timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check values a connection cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connection.timeout_secs must be greater than 0".to_string(),
            ));
        }
        // Room for the preamble plus at least one frame
        if self.channel_capacity < 2 {
            return Err(ConfigError::Invalid(
                "connection.channel_capacity must be at least 2".to_string(),
            ));
        }
        if self.max_message_bytes == 0 {
            return Err(ConfigError::Invalid(
                "connection.max_message_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the streaming server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Endpoint serving both the stream and control requests
    pub path: String,
    /// Connection settings
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            path: "/chat".to_string(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file, falling back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the connection timeout
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.connection.timeout_secs = timeout_secs;
        self
    }

    /// Set the endpoint path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Check values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "path must start with '/', got {:?}",
                self.path
            )));
        }
        self.connection.validate()
    }
}
