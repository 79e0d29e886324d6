//! Stateless frame encoding and decoding.
//!
//! ```text
//! offset  size  field
//!      0     4  total frame length (header included)
//!      4     1  protocol version
//!      5     1  message type tag
//!      6     8  sender agent id
//!     14     8  sequence number
//!     22     -  body
//! ```

use crate::int;
use crate::message::{ErrorCode, Header, Message, MessageType};
use bytes::{BufMut, Bytes, BytesMut};
use switchyard_types::{AgentId, MagicCookie, RouterId};
use thiserror::Error;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the common header.
pub const HEADER_LEN: usize = 22;

const LEN_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const TYPE_OFFSET: usize = 5;
const SENDER_OFFSET: usize = 6;
const SEQ_OFFSET: usize = 14;

/// Errors from [`encode`] and [`decode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Not enough bytes yet. Buffer more and retry; this is not a protocol
    /// violation.
    #[error("Incomplete frame: {needed} more bytes needed")]
    Incomplete { needed: usize },

    /// Inconsistent header or body. The stream cannot be resynchronized.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A well-framed message with a type tag this version does not know.
    /// The `len` bytes of the frame can be skipped.
    #[error("Unknown message type {tag} ({len} byte frame)")]
    UnknownType { tag: u8, len: usize },

    /// A message does not fit the configured limits.
    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

impl CodecError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }
}

impl From<int::OutOfBounds> for CodecError {
    fn from(e: int::OutOfBounds) -> Self {
        Self::Malformed(e.to_string())
    }
}

/// Largest frame accepted for a given payload limit.
pub fn max_frame_len(max_payload: u32) -> usize {
    let data = MessageType::Data.fixed_body_len() + max_payload as usize;
    let error = MessageType::Error.fixed_body_len() + u16::MAX as usize;
    HEADER_LEN + data.max(error)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode `msg` into a single frame.
///
/// Fails with [`CodecError::TooLarge`] when a data payload exceeds
/// `max_payload` or an error detail exceeds `u16::MAX` bytes.
pub fn encode(msg: &Message, max_payload: u32) -> Result<Bytes, CodecError> {
    let ty = msg.message_type();
    let body_len = match msg {
        Message::Data { payload, .. } | Message::DataReply { payload, .. } => {
            if payload.len() > max_payload as usize {
                return Err(CodecError::TooLarge {
                    size: payload.len(),
                    max: max_payload as usize,
                });
            }
            ty.fixed_body_len() + payload.len()
        }
        Message::Error { detail, .. } => {
            if detail.len() > u16::MAX as usize {
                return Err(CodecError::TooLarge {
                    size: detail.len(),
                    max: u16::MAX as usize,
                });
            }
            ty.fixed_body_len() + detail.len()
        }
        _ => ty.fixed_body_len(),
    };
    let total = HEADER_LEN + body_len;

    let mut buf = BytesMut::with_capacity(total);
    let header = msg.header();
    buf.put_u32(total as u32);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(ty.tag());
    buf.put_u64(header.sender.0);
    buf.put_u64(header.seq);

    match msg {
        Message::RegistrationRequest {
            requested_id,
            cookie,
            router_id,
            ..
        } => {
            buf.put_u64(requested_id.0);
            buf.put_slice(&cookie.0);
            buf.put_u64(router_id.0);
        }
        Message::RegistrationReply {
            agent_id,
            cookie,
            router_id,
            heartbeat_timeout_ms,
            ..
        } => {
            buf.put_u64(agent_id.0);
            buf.put_slice(&cookie.0);
            buf.put_u64(router_id.0);
            buf.put_u32(*heartbeat_timeout_ms);
        }
        Message::Data {
            recipient, payload, ..
        }
        | Message::DataReply {
            recipient, payload, ..
        } => {
            buf.put_u64(recipient.0);
            buf.put_u32(payload.len() as u32);
            buf.put_slice(payload);
        }
        Message::Error { code, detail, .. } => {
            buf.put_u8(code.code());
            buf.put_u16(detail.len() as u16);
            buf.put_slice(detail.as_bytes());
        }
        Message::ReloadConfig { admin_cookie, .. } => {
            buf.put_slice(&admin_cookie.0);
        }
        Message::Heartbeat { .. } | Message::HeartbeatAck { .. } | Message::Disconnect { .. } => {}
    }

    debug_assert_eq!(buf.len(), total);
    Ok(buf.freeze())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Length of the complete frame starting at `offset`, once it is fully
/// buffered.
pub(crate) fn frame_len(buf: &[u8], offset: usize, max_payload: u32) -> Result<usize, CodecError> {
    let available = buf.len().saturating_sub(offset);
    if available < 4 {
        return Err(CodecError::Incomplete {
            needed: 4 - available,
        });
    }
    let len = int::get_u32(buf, offset + LEN_OFFSET)? as usize;
    if len < HEADER_LEN {
        return Err(CodecError::Malformed(format!(
            "declared length {len} is shorter than the header"
        )));
    }
    let max = max_frame_len(max_payload);
    if len > max {
        return Err(CodecError::Malformed(format!(
            "declared length {len} exceeds the limit of {max}"
        )));
    }
    if available < len {
        return Err(CodecError::Incomplete {
            needed: len - available,
        });
    }
    Ok(len)
}

/// Decode one message from `buf` starting at `offset`.
///
/// Returns the message and the number of bytes it occupied.
pub fn decode(buf: &[u8], offset: usize, max_payload: u32) -> Result<(Message, usize), CodecError> {
    let len = frame_len(buf, offset, max_payload)?;
    let frame = Bytes::copy_from_slice(&buf[offset..offset + len]);
    let msg = decode_frame(&frame, max_payload)?;
    Ok((msg, len))
}

/// Decode a buffer holding exactly one frame. Data payloads share the
/// frame's storage.
pub(crate) fn decode_frame(frame: &Bytes, max_payload: u32) -> Result<Message, CodecError> {
    let version = int::get_u8(frame, VERSION_OFFSET)?;
    if version != PROTOCOL_VERSION {
        return Err(CodecError::Malformed(format!(
            "unsupported protocol version {version}"
        )));
    }
    let tag = int::get_u8(frame, TYPE_OFFSET)?;
    let ty = MessageType::from_tag(tag).ok_or(CodecError::UnknownType {
        tag,
        len: frame.len(),
    })?;
    let header = Header::new(
        AgentId(int::get_u64(frame, SENDER_OFFSET)?),
        int::get_u64(frame, SEQ_OFFSET)?,
    );

    let body_len = frame.len() - HEADER_LEN;
    let fixed = ty.fixed_body_len();
    if body_len < fixed {
        return Err(CodecError::Malformed(format!(
            "{ty} body is {body_len} bytes, expected at least {fixed}"
        )));
    }
    let b = HEADER_LEN;
    let exact = |msg: Message| {
        if body_len == fixed {
            Ok(msg)
        } else {
            Err(CodecError::Malformed(format!(
                "{ty} body is {body_len} bytes, expected {fixed}"
            )))
        }
    };

    match ty {
        MessageType::RegistrationRequest => exact(Message::RegistrationRequest {
            header,
            requested_id: AgentId(int::get_u64(frame, b)?),
            cookie: read_cookie(frame, b + 8),
            router_id: RouterId(int::get_u64(frame, b + 8 + MagicCookie::LEN)?),
        }),
        MessageType::RegistrationReply => exact(Message::RegistrationReply {
            header,
            agent_id: AgentId(int::get_u64(frame, b)?),
            cookie: read_cookie(frame, b + 8),
            router_id: RouterId(int::get_u64(frame, b + 8 + MagicCookie::LEN)?),
            heartbeat_timeout_ms: int::get_u32(frame, b + 16 + MagicCookie::LEN)?,
        }),
        MessageType::Data | MessageType::DataReply => {
            let recipient = AgentId(int::get_u64(frame, b)?);
            let payload_len = int::get_u32(frame, b + 8)? as usize;
            if payload_len != body_len - fixed {
                return Err(CodecError::Malformed(format!(
                    "payload length {payload_len} disagrees with frame body of {body_len} bytes"
                )));
            }
            if payload_len > max_payload as usize {
                return Err(CodecError::Malformed(format!(
                    "payload length {payload_len} exceeds the limit of {max_payload}"
                )));
            }
            let payload = frame.slice(b + fixed..);
            Ok(if ty == MessageType::Data {
                Message::Data {
                    header,
                    recipient,
                    payload,
                }
            } else {
                Message::DataReply {
                    header,
                    recipient,
                    payload,
                }
            })
        }
        MessageType::Heartbeat => exact(Message::Heartbeat { header }),
        MessageType::HeartbeatAck => exact(Message::HeartbeatAck { header }),
        MessageType::Disconnect => exact(Message::Disconnect { header }),
        MessageType::Error => {
            let raw_code = int::get_u8(frame, b)?;
            let code = ErrorCode::from_code(raw_code)
                .ok_or_else(|| CodecError::Malformed(format!("unknown error code {raw_code}")))?;
            let detail_len = int::get_u16(frame, b + 1)? as usize;
            if detail_len != body_len - fixed {
                return Err(CodecError::Malformed(format!(
                    "detail length {detail_len} disagrees with frame body of {body_len} bytes"
                )));
            }
            let detail = std::str::from_utf8(&frame[b + fixed..])
                .map_err(|e| CodecError::Malformed(format!("error detail is not UTF-8: {e}")))?
                .to_string();
            Ok(Message::Error {
                header,
                code,
                detail,
            })
        }
        MessageType::ReloadConfig => exact(Message::ReloadConfig {
            header,
            admin_cookie: read_cookie(frame, b),
        }),
    }
}

// Callers have already checked the body covers the fixed part.
fn read_cookie(frame: &[u8], offset: usize) -> MagicCookie {
    let mut bytes = [0u8; MagicCookie::LEN];
    bytes.copy_from_slice(&frame[offset..offset + MagicCookie::LEN]);
    MagicCookie(bytes)
}
