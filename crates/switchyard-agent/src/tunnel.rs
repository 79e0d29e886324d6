//! One registered TCP connection to the router.

use crate::error::{AgentError, AgentResult};
use switchyard_types::{AgentConfig, Identity, RouterId};
use switchyard_wire::{read_frame, write_message, FrameBuffer, Message};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

pub(crate) struct Tunnel {
    pub(crate) reader: OwnedReadHalf,
    pub(crate) writer: OwnedWriteHalf,
    pub(crate) frames: FrameBuffer,
    pub(crate) identity: Identity,
    /// Heartbeat timeout the router advertised.
    pub(crate) heartbeat_timeout_ms: u32,
}

impl Tunnel {
    /// Connect and register, presenting `claim` if given.
    pub(crate) async fn open(config: &AgentConfig, claim: Option<Identity>) -> AgentResult<Self> {
        let stream = tokio::time::timeout(
            config.connect_timeout(),
            TcpStream::connect(config.router_addr.as_str()),
        )
        .await
        .map_err(|_| AgentError::Timeout("router connection"))??;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let mut frames = FrameBuffer::new(config.max_payload_size);

        let request =
            Message::registration_request(0, claim.map(|c| (c.agent_id, c.cookie, c.router_id)));
        write_message(&mut writer, &request, config.max_payload_size).await?;

        let reply = tokio::time::timeout(config.registration_timeout(), async {
            loop {
                match read_frame(&mut reader, &mut frames).await {
                    Ok(frame) => return Ok(frame.message),
                    Err(e) if e.is_skippable() => {
                        debug!(error = %e, "Skipping unknown frame during registration");
                    }
                    Err(e) => return Err(AgentError::from(e)),
                }
            }
        })
        .await
        .map_err(|_| AgentError::Timeout("registration reply"))??;

        let (identity, heartbeat_timeout_ms) = match reply {
            Message::RegistrationReply {
                agent_id,
                cookie,
                router_id,
                heartbeat_timeout_ms,
                ..
            } => (
                Identity {
                    agent_id,
                    cookie,
                    router_id,
                },
                heartbeat_timeout_ms,
            ),
            Message::Error { code, detail, .. } if code.is_registration_rejection() => {
                return Err(AgentError::RegistrationRejected { code, detail });
            }
            other => {
                return Err(AgentError::Protocol(format!(
                    "expected registration reply, got {}",
                    other.message_type()
                )));
            }
        };

        if let Some(claim) = claim {
            check_resumed(&claim, &identity)?;
        }
        if identity.agent_id.is_invalid() || heartbeat_timeout_ms == 0 {
            return Err(AgentError::Protocol(
                "registration reply without id or heartbeat timeout".to_string(),
            ));
        }

        Ok(Self {
            reader,
            writer,
            frames,
            identity,
            heartbeat_timeout_ms,
        })
    }
}

/// A resumed identity must come back unchanged from the same router.
fn check_resumed(claim: &Identity, granted: &Identity) -> AgentResult<()> {
    if granted.agent_id != claim.agent_id {
        return Err(AgentError::Protocol(format!(
            "asked to resume {}, router assigned {}",
            claim.agent_id, granted.agent_id
        )));
    }
    let known_router = claim.router_id != RouterId::UNKNOWN;
    if known_router && !claim.agent_id.is_reserved() && granted.router_id != claim.router_id {
        return Err(AgentError::Protocol(format!(
            "reply from router {}, expected {}",
            granted.router_id, claim.router_id
        )));
    }
    Ok(())
}
