//! Transport configuration
//!
//! Every field has a default, so an absent or partial config file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{paths, BridgeError, Result};

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Socket path override; defaults to [`paths::socket_path`]
    pub socket_path: Option<PathBuf>,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl BridgeConfig {
    /// Socket path to use, falling back to the XDG runtime location
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(paths::socket_path)
    }
}

/// Client-side timeouts and connect retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-request response deadline (default: 5000)
    pub request_timeout_ms: u64,
    /// Connect attempts before giving up (default: 10)
    pub connect_attempts: u32,
    /// Fixed delay between connect attempts (default: 200)
    pub connect_retry_delay_ms: u64,
    /// Wall-clock budget for the whole connect sequence (default: 5000)
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            connect_attempts: 10,
            connect_retry_delay_ms: 200,
            connect_timeout_ms: 5000,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Permission bits applied to the socket file (default: 0o600)
    pub socket_mode: u32,
    /// Largest frame accepted before the read buffer is dropped (default: 16 MiB)
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_mode: 0o600,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> Result<BridgeConfig> {
        let path = paths::config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(BridgeConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<BridgeConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| BridgeError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config = Self::parse(&content, path)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<BridgeConfig> {
        toml::from_str(content).map_err(|e| BridgeError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &BridgeConfig) -> Result<()> {
        if config.client.request_timeout_ms == 0 {
            return Err(BridgeError::config("request_timeout_ms must be greater than 0"));
        }

        if config.client.connect_attempts == 0 {
            return Err(BridgeError::config("connect_attempts must be at least 1"));
        }

        if config.client.connect_timeout_ms < config.client.connect_retry_delay_ms {
            return Err(BridgeError::config(
                "connect_timeout_ms must be at least connect_retry_delay_ms",
            ));
        }

        if config.server.socket_mode & !0o777 != 0 {
            return Err(BridgeError::config(format!(
                "socket_mode {:o} has bits outside 0o777",
                config.server.socket_mode
            )));
        }

        if config.server.max_frame_bytes < 1024 {
            return Err(BridgeError::config("max_frame_bytes must be at least 1024"));
        }

        Ok(())
    }
}
