//! Switchyard wire protocol.
//!
//! Every message is a self-delimiting binary frame: a 22-byte big-endian
//! header carrying the total frame length, protocol version, type tag,
//! sender and sequence number, followed by a type-specific body.
//!
//! ## Layout
//!
//! - **int**: fixed-width big-endian integer access at arbitrary offsets
//! - **message**: [`Message`], [`MessageType`], [`ErrorCode`]
//! - **codec**: stateless [`encode`] / [`decode`]
//! - **frame**: streaming [`FrameBuffer`] and async read/write helpers

pub mod codec;
pub mod frame;
pub mod int;
pub mod message;

pub use codec::{decode, encode, CodecError, HEADER_LEN, PROTOCOL_VERSION};
pub use frame::{read_frame, write_frame, write_message, Frame, FrameBuffer, WireError};
pub use message::{ErrorCode, Header, Message, MessageType};
