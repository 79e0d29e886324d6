//! Callbacks through which an agent receives traffic.

use async_trait::async_trait;
use bytes::Bytes;
use switchyard_types::AgentId;
use switchyard_wire::ErrorCode;
use tracing::debug;

/// An error notification from the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotification {
    pub code: ErrorCode,
    /// The agent the error concerns: the unreachable recipient, the
    /// disconnected peer, or this agent itself.
    pub agent: AgentId,
    /// Sequence number of the message that caused the error, `0` for
    /// broadcasts.
    pub seq: u64,
    pub detail: String,
}

/// Implemented by the embedding process to receive messages.
///
/// Calls are made from the agent's receive loop, one at a time and in
/// arrival order. A slow handler delays later messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a data payload from `sender`. A returned payload is sent back
    /// to `sender` as a reply carrying the same sequence number.
    async fn handle_data(&self, sender: AgentId, payload: Bytes) -> Option<Bytes>;

    /// Handle an error notification. The default logs it.
    async fn handle_error(&self, error: &ErrorNotification) {
        debug!(
            code = %error.code,
            agent_id = %error.agent,
            seq = error.seq,
            "Router reported an error"
        );
    }
}
