//! Agent-side error types.

use switchyard_types::AgentId;
use switchyard_wire::{ErrorCode, WireError};
use thiserror::Error;

/// Errors surfaced by [`crate::Agent`].
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Registration rejected by router: {code} ({detail})")]
    RegistrationRejected { code: ErrorCode, detail: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Wire error: {0}")]
    Wire(WireError),

    #[error("Payload of {size} bytes exceeds the limit of {max}")]
    PayloadTooLarge { size: usize, max: u32 },

    #[error("Recipient {0} is unknown to the router")]
    UnreachableRecipient(AgentId),

    #[error("Recipient {0} is overloaded")]
    RecipientOverloaded(AgentId),

    #[error("Recipient {0} disconnected")]
    RemoteDisconnected(AgentId),

    #[error("Tunnel to the router closed")]
    TunnelClosed,

    #[error("Agent is closed")]
    Closed,
}

impl AgentError {
    /// Whether the router refused the presented identity itself, as opposed
    /// to the cookie that came with it.
    pub fn is_identity_unknown(&self) -> bool {
        matches!(
            self,
            Self::RegistrationRejected {
                code: ErrorCode::InvalidAgentId | ErrorCode::InvalidRouterId,
                ..
            }
        )
    }
}

/// Stream failures are connection errors; only malformed frames stay wire
/// errors.
impl From<WireError> for AgentError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io) => Self::Connection(io),
            WireError::ConnectionClosed => Self::Connection(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "router closed the connection",
            )),
            WireError::Truncated { buffered } => Self::Connection(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("router closed the connection mid-frame ({buffered} bytes buffered)"),
            )),
            other @ WireError::Codec(_) => Self::Wire(other),
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_wire::CodecError;

    #[test]
    fn test_stream_failures_are_connection_errors() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(matches!(
            AgentError::from(WireError::Io(reset)),
            AgentError::Connection(_)
        ));
        assert!(matches!(
            AgentError::from(WireError::ConnectionClosed),
            AgentError::Connection(_)
        ));
        assert!(matches!(
            AgentError::from(WireError::Truncated { buffered: 3 }),
            AgentError::Connection(_)
        ));
    }

    #[test]
    fn test_codec_failures_stay_wire_errors() {
        let err = AgentError::from(WireError::Codec(CodecError::Malformed("bad header".into())));
        assert!(matches!(err, AgentError::Wire(_)));
    }
}
