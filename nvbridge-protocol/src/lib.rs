//! nvbridge-protocol: msgpack-rpc wire definitions
//!
//! This crate defines the three msgpack-rpc message shapes, their binary
//! encoding, and the framing used by both the client and the server side of
//! the Unix socket transport.

pub mod assembler;
pub mod codec;
pub mod messages;
pub mod types;

// Re-export main types at crate root
pub use assembler::{Assembled, Frame, FrameAssembler, FrameScanner, MAX_FRAME_SIZE};
pub use codec::{CodecError, RpcCodec};
pub use messages::{decode_one, decode_value, DecodeError, Message, Notification, Request, Response};
pub use types::{
    decode_ext_payload, decode_handle, encode_handle, BufDetachEvent, BufLinesEvent,
    EventParseError, HandleError,
};

/// The dynamically-typed payload unit carried by every message
pub use rmpv::Value;
