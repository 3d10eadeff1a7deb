//! msgpack-rpc message types
//!
//! Wire shapes, one top-level array per frame:
//!
//! ```text
//! Request:      [0, msgid, method, params]
//! Response:     [1, msgid, error,  result]
//! Notification: [2, method, params]
//! ```

use std::io::Cursor;

use rmpv::Value;

/// Message type tag for requests
pub const REQUEST: i64 = 0;
/// Message type tag for responses
pub const RESPONSE: i64 = 1;
/// Message type tag for notifications
pub const NOTIFICATION: i64 = 2;

/// Errors produced while decoding a frame
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// The bytes are a well-formed prefix of a frame but the frame is not complete yet
    #[error("Incomplete frame")]
    Incomplete,

    /// The byte stream is not valid msgpack; framing can't be recovered
    #[error("Invalid msgpack stream: {0}")]
    InvalidStream(String),

    #[error("Frame exceeds {max} bytes without completing")]
    FrameTooLarge { max: usize },

    #[error("Message is not an array")]
    NotAnArray,

    #[error("Message array is empty")]
    EmptyArray,

    #[error("Message type is not an integer")]
    NonIntegerMessageType,

    #[error("Invalid message type: {0}")]
    InvalidMessageType(i64),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Malformed notification: {0}")]
    MalformedNotification(String),
}

impl DecodeError {
    /// True when more bytes are needed before anything can be decoded
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete)
    }

    /// True when the stream position can no longer be trusted and buffered
    /// bytes must be discarded
    pub fn desynchronizes(&self) -> bool {
        matches!(self, Self::InvalidStream(_) | Self::FrameTooLarge { .. })
    }
}

/// A call expecting a [`Response`] with the same `msgid`
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub msgid: u32,
    pub method: String,
    pub params: Vec<Value>,
}

/// The answer to a [`Request`]; `error` is nil on success
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub msgid: u32,
    pub error: Value,
    pub result: Value,
}

/// A one-way message with no expected reply
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Vec<Value>,
}

/// One msgpack-rpc frame
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Request {
    pub fn new(msgid: u32, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            msgid,
            method: method.into(),
            params,
        }
    }

    pub fn into_message(self) -> Message {
        Message::Request(self)
    }
}

impl Response {
    /// Successful response carrying `result`
    pub fn ok(msgid: u32, result: Value) -> Self {
        Self {
            msgid,
            error: Value::Nil,
            result,
        }
    }

    /// Failed response carrying `error`
    pub fn err(msgid: u32, error: Value) -> Self {
        Self {
            msgid,
            error,
            result: Value::Nil,
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_nil()
    }

    /// Split into the peer's result or the peer's error value
    pub fn into_result(self) -> Result<Value, Value> {
        if self.error.is_nil() {
            Ok(self.result)
        } else {
            Err(self.error)
        }
    }
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn into_message(self) -> Message {
        Message::Notification(self)
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Message::Response(resp)
    }
}

impl From<Notification> for Message {
    fn from(notif: Notification) -> Self {
        Message::Notification(notif)
    }
}

impl Message {
    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Notification(notif) => Some(&notif.method),
            Message::Response(_) => None,
        }
    }

    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Notification(_) => "notification",
        }
    }

    /// Build the top-level msgpack array for this message
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request(req) => Value::Array(vec![
                Value::from(REQUEST),
                Value::from(req.msgid),
                Value::from(req.method.as_str()),
                Value::Array(req.params.clone()),
            ]),
            Message::Response(resp) => Value::Array(vec![
                Value::from(RESPONSE),
                Value::from(resp.msgid),
                resp.error.clone(),
                resp.result.clone(),
            ]),
            Message::Notification(notif) => Value::Array(vec![
                Value::from(NOTIFICATION),
                Value::from(notif.method.as_str()),
                Value::Array(notif.params.clone()),
            ]),
        }
    }

    /// Interpret an already-decoded msgpack value as a message
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut items = match value {
            Value::Array(items) => items,
            _ => return Err(DecodeError::NotAnArray),
        };

        let kind = match items.first() {
            None => return Err(DecodeError::EmptyArray),
            Some(first) => first.as_i64().ok_or(DecodeError::NonIntegerMessageType)?,
        };

        match kind {
            REQUEST => {
                if items.len() != 4 {
                    return Err(DecodeError::MalformedRequest(format!(
                        "expected 4 elements, found {}",
                        items.len()
                    )));
                }
                let params = take_params(items.pop(), DecodeError::MalformedRequest)?;
                let method = take_method(items.pop(), DecodeError::MalformedRequest)?;
                let msgid = take_msgid(items.pop(), DecodeError::MalformedRequest)?;
                Ok(Message::Request(Request {
                    msgid,
                    method,
                    params,
                }))
            }
            RESPONSE => {
                if items.len() != 4 {
                    return Err(DecodeError::MalformedResponse(format!(
                        "expected 4 elements, found {}",
                        items.len()
                    )));
                }
                let result = items.pop().unwrap_or(Value::Nil);
                let error = items.pop().unwrap_or(Value::Nil);
                let msgid = take_msgid(items.pop(), DecodeError::MalformedResponse)?;
                Ok(Message::Response(Response {
                    msgid,
                    error,
                    result,
                }))
            }
            NOTIFICATION => {
                if items.len() != 3 {
                    return Err(DecodeError::MalformedNotification(format!(
                        "expected 3 elements, found {}",
                        items.len()
                    )));
                }
                let params = take_params(items.pop(), DecodeError::MalformedNotification)?;
                let method = take_method(items.pop(), DecodeError::MalformedNotification)?;
                Ok(Message::Notification(Notification { method, params }))
            }
            other => Err(DecodeError::InvalidMessageType(other)),
        }
    }

    /// Encode to the msgpack wire representation
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Append the wire representation to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        // Writing into a Vec can't fail with an I/O error; the value tree is
        // always representable because it was built from valid Values.
        if let Err(e) = rmpv::encode::write_value(buf, &self.to_value()) {
            tracing::error!("Failed to encode {} message: {}", self.kind(), e);
        }
    }
}

fn take_msgid(
    value: Option<Value>,
    malformed: fn(String) -> DecodeError,
) -> Result<u32, DecodeError> {
    let value = value.ok_or_else(|| malformed("missing msgid".into()))?;
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| malformed(format!("msgid is not a 32-bit unsigned integer: {}", value)))
}

fn take_method(
    value: Option<Value>,
    malformed: fn(String) -> DecodeError,
) -> Result<String, DecodeError> {
    match value {
        Some(Value::String(s)) => s
            .into_str()
            .ok_or_else(|| malformed("method name is not valid UTF-8".into())),
        Some(other) => Err(malformed(format!("method name is not a string: {}", other))),
        None => Err(malformed("missing method name".into())),
    }
}

fn take_params(
    value: Option<Value>,
    malformed: fn(String) -> DecodeError,
) -> Result<Vec<Value>, DecodeError> {
    match value {
        Some(Value::Array(params)) => Ok(params),
        Some(other) => Err(malformed(format!("params is not an array: {}", other))),
        None => Err(malformed("missing params".into())),
    }
}

/// Decode one msgpack value from the front of `bytes`
///
/// Returns the value and the number of bytes it occupied. A truncated but
/// otherwise well-formed prefix yields [`DecodeError::Incomplete`].
pub fn decode_value(bytes: &[u8]) -> Result<(Value, usize), DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Incomplete);
    }

    let mut cursor = Cursor::new(bytes);
    match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => Ok((value, cursor.position() as usize)),
        Err(rmpv::decode::Error::InvalidMarkerRead(e))
        | Err(rmpv::decode::Error::InvalidDataRead(e))
            if e.kind() == std::io::ErrorKind::UnexpectedEof =>
        {
            Err(DecodeError::Incomplete)
        }
        Err(e) => Err(DecodeError::InvalidStream(e.to_string())),
    }
}

/// Decode one message from the front of `bytes`
///
/// Returns the message and the number of bytes consumed.
pub fn decode_one(bytes: &[u8]) -> Result<(Message, usize), DecodeError> {
    let (value, consumed) = decode_value(bytes)?;
    let msg = Message::from_value(value)?;
    Ok((msg, consumed))
}
