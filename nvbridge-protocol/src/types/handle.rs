//! Remote object handles
//!
//! The editor sends handles either as plain integers or as extension values
//! whose payload is itself a msgpack-encoded integer. The payload width is
//! dispatched on its exact length.

use rmpv::Value;

/// Handle decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("Value is not a handle: {0}")]
    NotAHandle(String),

    #[error("Invalid handle payload of {len} bytes")]
    InvalidPayload { len: usize },

    #[error("Handle value out of range")]
    OutOfRange,
}

/// Decode a handle from a plain integer or an extension value
pub fn decode_handle(value: &Value) -> Result<i64, HandleError> {
    match value {
        Value::Integer(n) => n.as_i64().ok_or(HandleError::OutOfRange),
        Value::Ext(_, data) => decode_ext_payload(data),
        other => Err(HandleError::NotAHandle(other.to_string())),
    }
}

/// Parse the raw bytes of a handle extension value
///
/// Accepted layouts: a single positive fixint byte, or a uint/int marker
/// followed by a 1, 2, 4 or 8 byte big-endian payload.
pub fn decode_ext_payload(data: &[u8]) -> Result<i64, HandleError> {
    let invalid = || HandleError::InvalidPayload { len: data.len() };

    match data.len() {
        1 => {
            let b = data[0];
            if b <= 0x7f {
                Ok(i64::from(b))
            } else {
                Err(invalid())
            }
        }
        2 => match data[0] {
            0xcc => Ok(i64::from(data[1])),
            0xd0 => Ok(i64::from(data[1] as i8)),
            _ => Err(invalid()),
        },
        3 => {
            let raw = [data[1], data[2]];
            match data[0] {
                0xcd => Ok(i64::from(u16::from_be_bytes(raw))),
                0xd1 => Ok(i64::from(i16::from_be_bytes(raw))),
                _ => Err(invalid()),
            }
        }
        5 => {
            let raw = [data[1], data[2], data[3], data[4]];
            match data[0] {
                0xce => Ok(i64::from(u32::from_be_bytes(raw))),
                0xd2 => Ok(i64::from(i32::from_be_bytes(raw))),
                _ => Err(invalid()),
            }
        }
        9 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[1..]);
            match data[0] {
                0xcf => i64::try_from(u64::from_be_bytes(raw)).map_err(|_| HandleError::OutOfRange),
                0xd3 => Ok(i64::from_be_bytes(raw)),
                _ => Err(invalid()),
            }
        }
        _ => Err(invalid()),
    }
}

/// Build an extension value carrying `id`, using the narrowest payload
pub fn encode_handle(tag: i8, id: u64) -> Value {
    let payload = if id <= 0x7f {
        vec![id as u8]
    } else if id <= u64::from(u8::MAX) {
        vec![0xcc, id as u8]
    } else if id <= u64::from(u16::MAX) {
        let mut v = vec![0xcd];
        v.extend_from_slice(&(id as u16).to_be_bytes());
        v
    } else if id <= u64::from(u32::MAX) {
        let mut v = vec![0xce];
        v.extend_from_slice(&(id as u32).to_be_bytes());
        v
    } else {
        let mut v = vec![0xcf];
        v.extend_from_slice(&id.to_be_bytes());
        v
    };
    Value::Ext(tag, payload)
}
