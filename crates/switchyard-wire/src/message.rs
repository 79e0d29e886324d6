//! Wire message types.

use bytes::Bytes;
use switchyard_types::{AgentId, MagicCookie, RouterId};

/// Message type tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    RegistrationRequest = 0,
    RegistrationReply = 1,
    Data = 2,
    DataReply = 3,
    Heartbeat = 4,
    HeartbeatAck = 5,
    Error = 6,
    Disconnect = 7,
    ReloadConfig = 8,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::RegistrationRequest,
            1 => Self::RegistrationReply,
            2 => Self::Data,
            3 => Self::DataReply,
            4 => Self::Heartbeat,
            5 => Self::HeartbeatAck,
            6 => Self::Error,
            7 => Self::Disconnect,
            8 => Self::ReloadConfig,
            _ => return None,
        })
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Body bytes that precede any variable-length part.
    pub(crate) fn fixed_body_len(self) -> usize {
        match self {
            Self::RegistrationRequest => 8 + MagicCookie::LEN + 8,
            Self::RegistrationReply => 8 + MagicCookie::LEN + 8 + 4,
            Self::Data | Self::DataReply => 8 + 4,
            Self::Heartbeat | Self::HeartbeatAck | Self::Disconnect => 0,
            Self::Error => 1 + 2,
            Self::ReloadConfig => MagicCookie::LEN,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RegistrationRequest => "registration_request",
            Self::RegistrationReply => "registration_reply",
            Self::Data => "data",
            Self::DataReply => "data_reply",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Error => "error",
            Self::Disconnect => "disconnect",
            Self::ReloadConfig => "reload_config",
        };
        f.write_str(s)
    }
}

/// Error codes carried by [`Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// The agent named in the header has disconnected.
    DisconnectionBroadcast = 0,
    /// Data was addressed to an agent the router does not know.
    UnknownRecipient = 1,
    /// Registration claimed an agent id the router does not know.
    InvalidAgentId = 2,
    /// Registration carried a router id issued by another router process.
    InvalidRouterId = 3,
    /// Registration cookie did not match the claimed agent id.
    WrongMagicCookie = 4,
    MalformedMessage = 5,
    /// The recipient's queue is full; the message was not delivered.
    RecipientOverloaded = 6,
}

impl ErrorCode {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::DisconnectionBroadcast,
            1 => Self::UnknownRecipient,
            2 => Self::InvalidAgentId,
            3 => Self::InvalidRouterId,
            4 => Self::WrongMagicCookie,
            5 => Self::MalformedMessage,
            6 => Self::RecipientOverloaded,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether this code rejects a registration attempt.
    pub fn is_registration_rejection(self) -> bool {
        matches!(
            self,
            Self::InvalidAgentId | Self::InvalidRouterId | Self::WrongMagicCookie
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DisconnectionBroadcast => "disconnection broadcast",
            Self::UnknownRecipient => "unknown recipient",
            Self::InvalidAgentId => "invalid agent id",
            Self::InvalidRouterId => "invalid router id",
            Self::WrongMagicCookie => "wrong magic cookie",
            Self::MalformedMessage => "malformed message",
            Self::RecipientOverloaded => "recipient overloaded",
        };
        f.write_str(s)
    }
}

/// Fields common to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sending agent. For router errors: the agent the error concerns.
    pub sender: AgentId,
    /// Sender-chosen sequence number. Replies and errors echo the sequence
    /// number of the message they answer.
    pub seq: u64,
}

impl Header {
    pub const fn new(sender: AgentId, seq: u64) -> Self {
        Self { sender, seq }
    }
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RegistrationRequest {
        header: Header,
        /// `AgentId::INVALID` asks for a fresh id.
        requested_id: AgentId,
        cookie: MagicCookie,
        router_id: RouterId,
    },
    RegistrationReply {
        header: Header,
        agent_id: AgentId,
        cookie: MagicCookie,
        router_id: RouterId,
        heartbeat_timeout_ms: u32,
    },
    Data {
        header: Header,
        recipient: AgentId,
        payload: Bytes,
    },
    DataReply {
        header: Header,
        recipient: AgentId,
        payload: Bytes,
    },
    Heartbeat {
        header: Header,
    },
    HeartbeatAck {
        header: Header,
    },
    Error {
        header: Header,
        code: ErrorCode,
        detail: String,
    },
    Disconnect {
        header: Header,
    },
    ReloadConfig {
        header: Header,
        admin_cookie: MagicCookie,
    },
}

impl Message {
    pub fn header(&self) -> &Header {
        match self {
            Self::RegistrationRequest { header, .. }
            | Self::RegistrationReply { header, .. }
            | Self::Data { header, .. }
            | Self::DataReply { header, .. }
            | Self::Heartbeat { header }
            | Self::HeartbeatAck { header }
            | Self::Error { header, .. }
            | Self::Disconnect { header }
            | Self::ReloadConfig { header, .. } => header,
        }
    }

    pub fn sender(&self) -> AgentId {
        self.header().sender
    }

    pub fn seq(&self) -> u64 {
        self.header().seq
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::RegistrationRequest { .. } => MessageType::RegistrationRequest,
            Self::RegistrationReply { .. } => MessageType::RegistrationReply,
            Self::Data { .. } => MessageType::Data,
            Self::DataReply { .. } => MessageType::DataReply,
            Self::Heartbeat { .. } => MessageType::Heartbeat,
            Self::HeartbeatAck { .. } => MessageType::HeartbeatAck,
            Self::Error { .. } => MessageType::Error,
            Self::Disconnect { .. } => MessageType::Disconnect,
            Self::ReloadConfig { .. } => MessageType::ReloadConfig,
        }
    }

    // -- constructors -------------------------------------------------------

    /// Registration request; pass `None` to ask for a fresh identity.
    pub fn registration_request(
        seq: u64,
        previous: Option<(AgentId, MagicCookie, RouterId)>,
    ) -> Self {
        let (requested_id, cookie, router_id) =
            previous.unwrap_or((AgentId::INVALID, MagicCookie::NONE, RouterId::UNKNOWN));
        Self::RegistrationRequest {
            header: Header::new(requested_id, seq),
            requested_id,
            cookie,
            router_id,
        }
    }

    pub fn registration_reply(
        seq: u64,
        agent_id: AgentId,
        cookie: MagicCookie,
        router_id: RouterId,
        heartbeat_timeout_ms: u32,
    ) -> Self {
        Self::RegistrationReply {
            header: Header::new(AgentId::INVALID, seq),
            agent_id,
            cookie,
            router_id,
            heartbeat_timeout_ms,
        }
    }

    pub fn data(sender: AgentId, seq: u64, recipient: AgentId, payload: Bytes) -> Self {
        Self::Data {
            header: Header::new(sender, seq),
            recipient,
            payload,
        }
    }

    pub fn data_reply(sender: AgentId, seq: u64, recipient: AgentId, payload: Bytes) -> Self {
        Self::DataReply {
            header: Header::new(sender, seq),
            recipient,
            payload,
        }
    }

    pub fn heartbeat(sender: AgentId, seq: u64) -> Self {
        Self::Heartbeat {
            header: Header::new(sender, seq),
        }
    }

    pub fn heartbeat_ack(seq: u64) -> Self {
        Self::HeartbeatAck {
            header: Header::new(AgentId::INVALID, seq),
        }
    }

    /// Router error about `subject`, echoing the offending `seq`.
    pub fn error(subject: AgentId, seq: u64, code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Error {
            header: Header::new(subject, seq),
            code,
            detail: detail.into(),
        }
    }

    pub fn disconnect(sender: AgentId, seq: u64) -> Self {
        Self::Disconnect {
            header: Header::new(sender, seq),
        }
    }

    pub fn reload_config(seq: u64, admin_cookie: MagicCookie) -> Self {
        Self::ReloadConfig {
            header: Header::new(AgentId::INVALID, seq),
            admin_cookie,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_roundtrip() {
        for tag in 0..=8u8 {
            let ty = MessageType::from_tag(tag).unwrap();
            assert_eq!(ty.tag(), tag);
        }
        assert!(MessageType::from_tag(9).is_none());
        assert!(MessageType::from_tag(0xff).is_none());
    }

    #[test]
    fn test_error_codes_roundtrip() {
        for code in 0..=6u8 {
            assert_eq!(ErrorCode::from_code(code).unwrap().code(), code);
        }
        assert!(ErrorCode::from_code(7).is_none());
    }

    #[test]
    fn test_registration_rejection_codes() {
        assert!(ErrorCode::WrongMagicCookie.is_registration_rejection());
        assert!(ErrorCode::InvalidRouterId.is_registration_rejection());
        assert!(!ErrorCode::UnknownRecipient.is_registration_rejection());
    }

    #[test]
    fn test_fresh_registration_request() {
        let msg = Message::registration_request(1, None);
        match msg {
            Message::RegistrationRequest {
                requested_id,
                cookie,
                router_id,
                ..
            } => {
                assert!(requested_id.is_invalid());
                assert!(cookie.is_none());
                assert!(router_id.is_unknown());
            }
            other => panic!("Expected RegistrationRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_error_header_names_subject() {
        let msg = Message::error(AgentId(4100), 77, ErrorCode::UnknownRecipient, "gone");
        assert_eq!(msg.sender(), AgentId(4100));
        assert_eq!(msg.seq(), 77);
        assert_eq!(msg.message_type(), MessageType::Error);
    }
}
