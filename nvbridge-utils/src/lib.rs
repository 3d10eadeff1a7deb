//! nvbridge-utils: Common utilities shared across nvbridge crates
//!
//! This crate provides:
//! - Unified error types ([`BridgeError`], [`Result`])
//! - Logging infrastructure ([`init_logging`], [`LogConfig`])
//! - Transport configuration ([`BridgeConfig`], [`ConfigLoader`])
//! - XDG-compliant path utilities ([`paths`] module)

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

// Re-export main types at crate root for convenience
pub use config::{BridgeConfig, ClientConfig, ConfigLoader, ServerConfig};
pub use error::{BridgeError, Result};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogOutput};

// Re-export commonly used path functions
pub use paths::{
    config_dir, config_file, ensure_private_dir, log_dir, runtime_dir, socket_path, state_dir,
};
