//! Message codec for IPC framing

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::assembler::{Frame, FrameScanner};
use crate::messages::Message;

/// Protocol codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec shared by the client and server side of a connection
///
/// Decoding yields [`Frame`]s rather than failing the stream, so a single bad
/// frame never tears down the connection.
#[derive(Debug, Clone)]
pub struct RpcCodec {
    scanner: FrameScanner,
}

impl RpcCodec {
    pub fn new() -> Self {
        Self {
            scanner: FrameScanner::new(),
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            scanner: FrameScanner::with_max_frame_size(max_frame_size),
        }
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RpcCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.scanner.next_frame(src))
    }
}

impl Encoder<Message> for RpcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item.encode();
        dst.extend_from_slice(&data);
        Ok(())
    }
}
