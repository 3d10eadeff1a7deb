//! Frame assembly over a growing byte buffer
//!
//! msgpack-rpc has no length prefix: a frame ends where its top-level array
//! ends. Bytes are accumulated until the end of a complete value is in the
//! buffer, and only then is the value decoded. Shape
//! errors skip just the offending frame; a stream that is not msgpack at all
//! has no resync point, so the buffered bytes are dropped.

use bytes::{Bytes, BytesMut};
use rmp::Marker;

use crate::messages::{decode_value, DecodeError, Message};

/// Maximum size of a single frame (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One unit pulled off the byte stream
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(Message),
    /// A frame that could not be turned into a message. Non-fatal.
    Invalid(DecodeError),
}

/// Finds frame boundaries in a growing buffer
///
/// Walks msgpack markers and length headers without building any values, and
/// keeps its place between calls, so a large frame arriving over many reads
/// is walked once. A value is only materialized after its last byte is
/// buffered. The walk state always describes the bytes at the front of the
/// buffer handed to [`next_frame`](Self::next_frame); anything else that
/// consumes that buffer must call [`reset`](Self::reset).
#[derive(Debug, Clone)]
pub struct FrameScanner {
    max_frame_size: usize,
    /// Bytes of the current frame already accounted for
    offset: usize,
    /// Values still to walk before the frame is complete
    pending: usize,
}

impl FrameScanner {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            offset: 0,
            pending: 0,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Forget progress on the current frame
    pub fn reset(&mut self) {
        self.offset = 0;
        self.pending = 0;
    }

    /// Pull the next frame off the front of `buf`
    ///
    /// Returns `None` when `buf` holds nothing or only a truncated frame; the
    /// partial bytes stay in `buf`. On a desynchronizing error the whole
    /// buffer is cleared.
    pub fn next_frame(&mut self, buf: &mut BytesMut) -> Option<Frame> {
        if buf.is_empty() {
            self.reset();
            return None;
        }

        match self.frame_len(buf) {
            Ok(Some(len)) => {
                self.reset();
                let bytes = buf.split_to(len);
                Some(match decode_value(&bytes) {
                    Ok((value, _)) => match Message::from_value(value) {
                        Ok(msg) => Frame::Message(msg),
                        Err(e) => Frame::Invalid(e),
                    },
                    // Boundaries are known, so only this frame is lost
                    Err(e) => Frame::Invalid(e),
                })
            }
            Ok(None) if buf.len() > self.max_frame_size => {
                self.reset();
                buf.clear();
                Some(Frame::Invalid(DecodeError::FrameTooLarge {
                    max: self.max_frame_size,
                }))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(dropped = buf.len(), "Discarding unparsable read buffer: {}", e);
                self.reset();
                buf.clear();
                Some(Frame::Invalid(e))
            }
        }
    }

    /// Length of the frame at the front of `buf`, once all of it is buffered
    fn frame_len(&mut self, buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        if self.offset == 0 && self.pending == 0 {
            self.pending = 1;
        }

        while self.pending > 0 {
            let Some(&marker) = buf.get(self.offset) else {
                return Ok(None);
            };
            let Some((size, children)) = value_extent(marker, &buf[self.offset + 1..])? else {
                return Ok(None);
            };
            self.offset += 1 + size;
            self.pending = (self.pending - 1).saturating_add(children);
        }

        Ok((self.offset <= buf.len()).then_some(self.offset))
    }
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes following `marker` that belong to its value, and how many nested
/// values come after them
///
/// `None` means the length header itself is not buffered yet.
fn value_extent(marker: u8, rest: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
    let header = |width: usize| {
        rest.get(..width)
            .map(|bytes| bytes.iter().fold(0usize, |n, &b| (n << 8) | usize::from(b)))
    };

    let extent = match Marker::from_u8(marker) {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            Some((0, 0))
        }
        Marker::U8 | Marker::I8 => Some((1, 0)),
        Marker::U16 | Marker::I16 => Some((2, 0)),
        Marker::U32 | Marker::I32 | Marker::F32 => Some((4, 0)),
        Marker::U64 | Marker::I64 | Marker::F64 => Some((8, 0)),
        Marker::FixStr(len) => Some((usize::from(len), 0)),
        Marker::Str8 | Marker::Bin8 => header(1).map(|len| (1 + len, 0)),
        Marker::Str16 | Marker::Bin16 => header(2).map(|len| (2 + len, 0)),
        Marker::Str32 | Marker::Bin32 => header(4).map(|len| (4 + len, 0)),
        Marker::FixArray(len) => Some((0, usize::from(len))),
        Marker::Array16 => header(2).map(|len| (2, len)),
        Marker::Array32 => header(4).map(|len| (4, len)),
        Marker::FixMap(len) => Some((0, 2 * usize::from(len))),
        Marker::Map16 => header(2).map(|len| (2, 2 * len)),
        Marker::Map32 => header(4).map(|len| (4, 2 * len)),
        // Type byte plus data
        Marker::FixExt1 => Some((2, 0)),
        Marker::FixExt2 => Some((3, 0)),
        Marker::FixExt4 => Some((5, 0)),
        Marker::FixExt8 => Some((9, 0)),
        Marker::FixExt16 => Some((17, 0)),
        Marker::Ext8 => header(1).map(|len| (2 + len, 0)),
        Marker::Ext16 => header(2).map(|len| (3 + len, 0)),
        Marker::Ext32 => header(4).map(|len| (5 + len, 0)),
        Marker::Reserved => {
            return Err(DecodeError::InvalidStream(format!(
                "reserved marker 0x{:02x}",
                marker
            )))
        }
    };

    Ok(extent)
}

/// Result of a single [`FrameAssembler::feed`] call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assembled {
    /// Complete messages, in wire order
    pub messages: Vec<Message>,
    /// Bytes of a partial frame still waiting for more input
    pub remainder: Bytes,
    /// Decode errors encountered along the way
    pub errors: Vec<DecodeError>,
}

/// Accumulates socket reads and splits them into messages
#[derive(Debug)]
pub struct FrameAssembler {
    buf: BytesMut,
    scanner: FrameScanner,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanner: FrameScanner::with_max_frame_size(max_frame_size),
        }
    }

    /// Append `bytes` and decode every complete frame now available
    ///
    /// The returned remainder is a copy of the buffered partial frame.
    pub fn feed(&mut self, bytes: &[u8]) -> Assembled {
        self.buf.extend_from_slice(bytes);

        let mut out = Assembled::default();
        while let Some(frame) = self.scanner.next_frame(&mut self.buf) {
            match frame {
                Frame::Message(msg) => out.messages.push(msg),
                Frame::Invalid(e) => out.errors.push(e),
            }
        }
        out.remainder = Bytes::copy_from_slice(&self.buf);
        out
    }

    /// Bytes of an incomplete frame held for the next `feed`
    pub fn remainder(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop any buffered partial frame
    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanner.reset();
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
