//! Error types for nvbridge
//!
//! Provides the error type shared by configuration, logging and the server
//! side of the transport.

use std::path::PathBuf;

/// Main error type for nvbridge operations
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Socket Errors ===

    #[error("Failed to bind socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Socket path too long ({len} bytes, max {max}): {path}")]
    SocketPathTooLong { path: PathBuf, len: usize, max: usize },

    #[error("Refusing to replace non-socket file at {path}")]
    NotASocket { path: PathBuf },

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;
