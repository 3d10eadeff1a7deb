//! Secondary decoding helpers layered on top of the message codec
//!
//! Nothing here is needed to move messages; these interpret payloads for
//! callers that care about handle values or structured editor events.

mod events;
mod handle;

pub use events::{BufDetachEvent, BufLinesEvent, EventParseError};
pub use handle::{decode_ext_payload, decode_handle, encode_handle, HandleError};
