//! nvbridge-client: msgpack-rpc client over a Unix domain socket
//!
//! [`ConnectionManager`] is the entry point. It lazily connects, correlates
//! requests with responses, and hands unsolicited notifications and requests
//! from the peer to the [`EventRouter`].

pub mod connection;
pub mod correlator;
pub mod error;
pub mod manager;
pub mod router;

pub use connection::{ClientTransport, ConnectionState, CrashCallback, DisconnectReason};
pub use correlator::{Completion, RequestCorrelator};
pub use error::ClientError;
pub use manager::{ConnectionManager, CrashHandler};
pub use router::{Event, EventHandler, EventRouter, Responder, SubscriptionId, SubscriptionTable};

pub use nvbridge_protocol::Value;
