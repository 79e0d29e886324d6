//! Streaming frame assembly over async byte streams.

use crate::codec::{self, CodecError};
use crate::message::Message;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes reserved ahead of each socket read.
const READ_CHUNK: usize = 8 * 1024;

/// Errors from reading or writing frames on a stream.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    /// The peer closed the stream on a frame boundary.
    #[error("Connection closed")]
    ConnectionClosed,
    /// The peer closed the stream in the middle of a frame.
    #[error("Connection closed with {buffered} bytes of an incomplete frame")]
    Truncated { buffered: usize },
}

impl WireError {
    /// A frame of unknown type was skipped; the stream is still usable.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Codec(CodecError::UnknownType { .. }))
    }
}

/// A decoded message together with the exact bytes it arrived as.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message: Message,
    pub raw: Bytes,
}

/// Accumulates partial reads and yields complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_payload: u32,
}

impl FrameBuffer {
    pub fn new(max_payload: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            max_payload,
        }
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, or `None` if more bytes are needed.
    ///
    /// A frame of unknown type is consumed before
    /// [`CodecError::UnknownType`] is returned, so the caller may carry on.
    /// Any other error leaves the buffer unusable.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        let len = match codec::frame_len(&self.buf, 0, self.max_payload) {
            Ok(len) => len,
            Err(e) if e.is_incomplete() => return Ok(None),
            Err(e) => return Err(e),
        };
        let raw = self.buf.split_to(len).freeze();
        let message = codec::decode_frame(&raw, self.max_payload)?;
        Ok(Some(Frame { message, raw }))
    }
}

/// Read the next frame from `reader`.
///
/// Cancel-safe: bytes read before cancellation stay in `frames`.
pub async fn read_frame<R>(reader: &mut R, frames: &mut FrameBuffer) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = frames.next_frame()? {
            return Ok(frame);
        }
        frames.buf.reserve(READ_CHUNK);
        let n = reader.read_buf(&mut frames.buf).await?;
        if n == 0 {
            return Err(if frames.buf.is_empty() {
                WireError::ConnectionClosed
            } else {
                WireError::Truncated {
                    buffered: frames.buf.len(),
                }
            });
        }
    }
}

/// Write pre-encoded frame bytes.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write a single message.
pub async fn write_message<W>(
    writer: &mut W,
    msg: &Message,
    max_payload: u32,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = codec::encode(msg, max_payload)?;
    write_frame(writer, &bytes).await
}
