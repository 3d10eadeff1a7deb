//! nvbridge-server: msgpack-rpc listener on a Unix domain socket
//!
//! [`RpcServer`] accepts any number of clients and answers their requests
//! from a shared [`HandlerTable`]. Every server starts with two methods:
//! `ping`, which returns `"pong"`, and `log`, which writes its params to the
//! server log.

pub mod dispatch;
pub mod server;
mod session;

pub use dispatch::{unknown_method_error, BoxedHandler, HandlerResult, HandlerTable};
pub use server::{RpcServer, MAX_SOCKET_PATH};
