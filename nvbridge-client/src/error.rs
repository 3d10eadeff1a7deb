//! Client error types

use std::path::PathBuf;
use std::time::Duration;

use nvbridge_protocol::Value;

/// Errors surfaced by the client transport and connection manager
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,

    #[error("Failed to connect to {path} after {attempts} attempt(s): {cause}")]
    ConnectFailed {
        path: PathBuf,
        attempts: u32,
        cause: String,
    },

    /// No response arrived before the deadline
    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The connection went away while the request was in flight
    #[error("Request '{method}' cancelled: connection closed")]
    Cancelled { method: String },

    /// The peer answered with a non-nil error value
    #[error("Request '{method}' failed: {error}")]
    Remote { method: String, error: Value },

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Request {msgid} was already answered")]
    AlreadyAnswered { msgid: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Check if the operation may succeed on a fresh connection
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectFailed { .. } | Self::Cancelled { .. } | Self::ConnectionClosed
        )
    }

    /// Human-readable message from a remote error
    ///
    /// Peers commonly send `[kind, message]`; plain strings are accepted too.
    pub fn remote_message(&self) -> Option<String> {
        let Self::Remote { error, .. } = self else {
            return None;
        };
        match error {
            Value::Array(items) if items.len() == 2 => {
                items[1].as_str().map(str::to_owned).or_else(|| Some(error.to_string()))
            }
            Value::String(s) => s.as_str().map(str::to_owned),
            other => Some(other.to_string()),
        }
    }
}
