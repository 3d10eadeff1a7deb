//! Socket connection to the editor
//!
//! Each [`ClientTransport`] owns one Unix socket. A background task reads
//! frames, correlates responses, and forwards peer-initiated messages to the
//! [`EventRouter`](crate::EventRouter); a second task serializes writes.

mod state;
mod transport;

pub use state::{ConnectionState, DisconnectReason};
pub use transport::{ClientTransport, CrashCallback};

pub(crate) use transport::Command;
