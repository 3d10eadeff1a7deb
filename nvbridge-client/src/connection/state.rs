//! Connection lifecycle states

/// Observable state of a managed connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last connect attempt or the live connection failed
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Why a connection task stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local shutdown; never reported as a crash
    Requested,
    /// The peer closed its end of the socket
    PeerClosed,
    ReadFailed(String),
    WriteFailed(String),
}

impl DisconnectReason {
    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Requested)
    }

    /// State a manager should move to after this disconnect
    pub fn resulting_state(&self) -> ConnectionState {
        match self {
            Self::Requested | Self::PeerClosed => ConnectionState::Disconnected,
            Self::ReadFailed(cause) => ConnectionState::Error(format!("read failed: {}", cause)),
            Self::WriteFailed(cause) => ConnectionState::Error(format!("write failed: {}", cause)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resulting_state() {
        assert_eq!(
            DisconnectReason::PeerClosed.resulting_state(),
            ConnectionState::Disconnected
        );
        assert_eq!(
            DisconnectReason::ReadFailed("reset".into()).resulting_state(),
            ConnectionState::Error("read failed: reset".into())
        );
        assert!(!DisconnectReason::WriteFailed("x".into()).is_requested());
        assert!(DisconnectReason::Requested.is_requested());
    }

    #[test]
    fn test_is_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Error("x".into()).is_connected());
    }
}
