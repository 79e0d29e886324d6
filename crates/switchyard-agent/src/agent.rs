//! The agent: a registered endpoint with a background driver.
//!
//! [`Agent::connect`] registers with the router and spawns a driver task
//! that owns the tunnel. The driver writes queued outbound frames, while a
//! reader task dispatches inbound messages to the [`MessageHandler`] and a
//! heartbeat task feeds the outbound queue. When the tunnel fails, pending
//! requests are failed and, if the policy allows, the driver reconnects
//! with the stored identity.

use crate::backoff::compute_backoff;
use crate::error::{AgentError, AgentResult};
use crate::handler::{ErrorNotification, MessageHandler};
use crate::tunnel::Tunnel;
use crate::waiting_room::{Unlock, WaitingRoom};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use switchyard_types::{AgentConfig, AgentId, Identity};
use switchyard_wire::{read_frame, write_message, ErrorCode, FrameBuffer, Message, WireError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Connection state as seen by the embedding process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// The tunnel failed and the agent is trying to re-register.
    Reconnecting,
    /// The agent was closed or gave up reconnecting.
    Closed,
}

/// A frame waiting for the tunnel. The sender id is stamped when written,
/// since it can change across a reconnect.
#[derive(Debug)]
enum Outbound {
    Data {
        recipient: AgentId,
        seq: u64,
        payload: Bytes,
    },
    Reply {
        recipient: AgentId,
        seq: u64,
        payload: Bytes,
    },
    Heartbeat {
        seq: u64,
    },
}

impl Outbound {
    fn into_message(self, sender: AgentId) -> Message {
        match self {
            Self::Data {
                recipient,
                seq,
                payload,
            } => Message::data(sender, seq, recipient, payload),
            Self::Reply {
                recipient,
                seq,
                payload,
            } => Message::data_reply(sender, seq, recipient, payload),
            Self::Heartbeat { seq } => Message::heartbeat(sender, seq),
        }
    }
}

/// State shared by the public handle and the background tasks.
struct Shared {
    config: AgentConfig,
    handler: Arc<dyn MessageHandler>,
    identity: RwLock<Identity>,
    next_seq: AtomicU64,
    waiting: WaitingRoom,
    outbound: mpsc::Sender<Outbound>,
}

impl Shared {
    fn identity(&self) -> Identity {
        *self.identity.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_identity(&self, identity: Identity) {
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = identity;
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A connected agent. Dropping it disconnects from the router.
pub struct Agent {
    shared: Arc<Shared>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

impl Agent {
    /// Connect to the router and register.
    ///
    /// Presents `config.identity` when set. The initial registration is not
    /// retried; reconnection only applies once the agent is up.
    pub async fn connect(
        config: AgentConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> AgentResult<Self> {
        let tunnel = Tunnel::open(&config, config.identity).await?;
        info!(
            agent_id = %tunnel.identity.agent_id,
            router = %config.router_addr,
            "Agent registered"
        );

        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue_capacity.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Connected);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            identity: RwLock::new(tunnel.identity),
            config,
            handler,
            next_seq: AtomicU64::new(1),
            waiting: WaitingRoom::new(),
            outbound,
        });

        let driver = tokio::spawn(run(
            Arc::clone(&shared),
            tunnel,
            outbound_rx,
            shutdown_rx,
            state_tx,
        ));

        Ok(Self {
            shared,
            state,
            shutdown,
            driver: Some(driver),
        })
    }

    /// Current identity; persist it to resume after a restart.
    pub fn identity(&self) -> Identity {
        self.shared.identity()
    }

    pub fn agent_id(&self) -> AgentId {
        self.shared.identity().agent_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Queue `payload` for `recipient`. Waits while the outbound queue is
    /// full. Delivery failures arrive later through
    /// [`MessageHandler::handle_error`]. Returns the sequence number used.
    pub async fn send(&self, recipient: AgentId, payload: Bytes) -> AgentResult<u64> {
        self.check_size(&payload)?;
        let seq = self.shared.next_seq();
        self.shared
            .outbound
            .send(Outbound::Data {
                recipient,
                seq,
                payload,
            })
            .await
            .map_err(|_| AgentError::Closed)?;
        Ok(seq)
    }

    /// Send `payload` and wait up to `timeout` for the recipient's reply.
    pub async fn request(
        &self,
        recipient: AgentId,
        payload: Bytes,
        timeout: Duration,
    ) -> AgentResult<Bytes> {
        self.check_size(&payload)?;
        if *self.state.borrow() == ConnectionState::Closed {
            return Err(AgentError::Closed);
        }
        let seq = self.shared.next_seq();
        let waiter = self.shared.waiting.register(recipient, seq);
        // Removes the entry on every exit, including the future being dropped.
        let _pending = PendingRequest {
            waiting: &self.shared.waiting,
            recipient,
            seq,
        };

        let msg = Outbound::Data {
            recipient,
            seq,
            payload,
        };
        if self.shared.outbound.send(msg).await.is_err() {
            return Err(AgentError::Closed);
        }

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(Unlock::Reply(reply))) => Ok(reply),
            Ok(Ok(Unlock::UnknownRecipient)) => Err(AgentError::UnreachableRecipient(recipient)),
            Ok(Ok(Unlock::Overloaded)) => Err(AgentError::RecipientOverloaded(recipient)),
            Ok(Ok(Unlock::RemoteDisconnected)) => Err(AgentError::RemoteDisconnected(recipient)),
            Ok(Ok(Unlock::TunnelFailed)) => Err(AgentError::TunnelClosed),
            Ok(Err(_)) => Err(AgentError::Closed),
            Err(_) => Err(AgentError::Timeout("reply")),
        }
    }

    /// Flush queued frames, tell the router we are leaving, and stop.
    pub async fn close(mut self) {
        self.shutdown.send_replace(true);
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }

    /// Requests still waiting for a reply.
    #[doc(hidden)]
    pub fn pending_requests(&self) -> usize {
        self.shared.waiting.len()
    }

    fn check_size(&self, payload: &Bytes) -> AgentResult<()> {
        let max = self.shared.config.max_payload_size;
        if payload.len() > max as usize {
            return Err(AgentError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        Ok(())
    }
}

/// Cancels a waiting-room entry when the request ends.
struct PendingRequest<'a> {
    waiting: &'a WaitingRoom,
    recipient: AgentId,
    seq: u64,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.waiting.cancel(self.recipient, self.seq);
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

enum Ended {
    Shutdown,
    Failed(AgentError),
}

async fn run(
    shared: Arc<Shared>,
    mut tunnel: Tunnel,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
    state: watch::Sender<ConnectionState>,
) {
    loop {
        let agent_id = tunnel.identity.agent_id;
        let ended = drive(&shared, tunnel, &mut outbound_rx, &mut shutdown).await;
        let failed = shared.waiting.fail_all(Unlock::TunnelFailed);

        match ended {
            Ended::Shutdown => {
                debug!(agent_id = %agent_id, "Agent closed");
                break;
            }
            Ended::Failed(e) => {
                warn!(
                    agent_id = %agent_id,
                    error = %e,
                    failed_requests = failed,
                    "Tunnel to router lost"
                );
            }
        }

        if !shared.config.reconnect.enabled {
            break;
        }
        state.send_replace(ConnectionState::Reconnecting);
        match reconnect(&shared, &mut shutdown).await {
            Some(next) => {
                tunnel = next;
                state.send_replace(ConnectionState::Connected);
            }
            None => break,
        }
    }
    state.send_replace(ConnectionState::Closed);
}

/// Run one tunnel until it fails or the agent shuts down.
async fn drive(
    shared: &Arc<Shared>,
    tunnel: Tunnel,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
    shutdown: &mut watch::Receiver<bool>,
) -> Ended {
    let Tunnel {
        reader,
        mut writer,
        frames,
        identity,
        heartbeat_timeout_ms,
    } = tunnel;
    let agent_id = identity.agent_id;
    let max = shared.config.max_payload_size;

    let silence = Duration::from_millis(u64::from(heartbeat_timeout_ms));
    let mut reader_task = tokio::spawn(read_loop(Arc::clone(shared), reader, frames, silence));
    let heartbeat_task = tokio::spawn(heartbeat_loop(
        Arc::clone(shared),
        shared.config.heartbeat_interval(heartbeat_timeout_ms),
    ));

    let ended = loop {
        tokio::select! {
            // The watch guard must not live across the flush below.
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                flush_and_leave(&mut writer, outbound_rx, agent_id, shared, max).await;
                break Ended::Shutdown;
            }
            res = &mut reader_task => {
                break Ended::Failed(res.unwrap_or(AgentError::TunnelClosed));
            }
            out = outbound_rx.recv() => {
                let Some(out) = out else { break Ended::Shutdown };
                if let Err(e) = write_outbound(&mut writer, out, agent_id, max).await {
                    break Ended::Failed(e);
                }
            }
        }
    };

    reader_task.abort();
    heartbeat_task.abort();
    ended
}

async fn write_outbound(
    writer: &mut OwnedWriteHalf,
    out: Outbound,
    sender: AgentId,
    max: u32,
) -> AgentResult<()> {
    match write_message(writer, &out.into_message(sender), max).await {
        Ok(()) => Ok(()),
        Err(WireError::Codec(e)) => {
            warn!(agent_id = %sender, error = %e, "Dropping unencodable frame");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn flush_and_leave(
    writer: &mut OwnedWriteHalf,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
    agent_id: AgentId,
    shared: &Shared,
    max: u32,
) {
    while let Ok(out) = outbound_rx.try_recv() {
        if write_outbound(writer, out, agent_id, max).await.is_err() {
            return;
        }
    }
    let bye = Message::disconnect(agent_id, shared.next_seq());
    let _ = write_message(writer, &bye, max).await;
    let _ = writer.shutdown().await;
}

async fn heartbeat_loop(shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let beat = Outbound::Heartbeat {
            seq: shared.next_seq(),
        };
        // A full queue means traffic is flowing anyway.
        if let Err(mpsc::error::TrySendError::Closed(_)) = shared.outbound.try_send(beat) {
            return;
        }
    }
}

/// Re-register, backing off between attempts. `None` means give up.
async fn reconnect(shared: &Shared, shutdown: &mut watch::Receiver<bool>) -> Option<Tunnel> {
    let policy = &shared.config.reconnect;
    let mut claim = Some(shared.identity());
    let mut attempt = 0u32;

    loop {
        let delay = compute_backoff(policy, attempt);
        debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait_for(|stop| *stop) => return None,
        }

        match Tunnel::open(&shared.config, claim).await {
            Ok(tunnel) => {
                let previous = shared.identity().agent_id;
                shared.set_identity(tunnel.identity);
                if tunnel.identity.agent_id == previous {
                    info!(agent_id = %previous, "Agent reconnected");
                } else {
                    warn!(
                        previous = %previous,
                        agent_id = %tunnel.identity.agent_id,
                        "Agent registered under a new id"
                    );
                }
                return Some(tunnel);
            }
            Err(e) if e.is_identity_unknown() && claim.is_some() => {
                warn!(error = %e, "Router no longer knows this agent, registering anew");
                claim = None;
                continue;
            }
            Err(e @ AgentError::RegistrationRejected { .. }) => {
                error!(error = %e, "Reconnect refused, giving up");
                return None;
            }
            Err(e) => debug!(attempt = attempt + 1, error = %e, "Reconnect attempt failed"),
        }

        attempt = attempt.saturating_add(1);
        if policy.max_attempts > 0 && attempt >= policy.max_attempts {
            error!(attempts = attempt, "Reconnect attempts exhausted");
            return None;
        }
    }
}

// ---------------------------------------------------------------------------
// Receive path
// ---------------------------------------------------------------------------

/// Read until the tunnel fails. Inbound silence longer than the router's
/// heartbeat timeout counts as failure.
async fn read_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    mut frames: FrameBuffer,
    silence: Duration,
) -> AgentError {
    loop {
        let read = match tokio::time::timeout(silence, read_frame(&mut reader, &mut frames)).await
        {
            Ok(read) => read,
            Err(_) => return AgentError::Timeout("router heartbeat"),
        };
        match read {
            Ok(frame) => dispatch(&shared, frame.message).await,
            Err(e) if e.is_skippable() => debug!(error = %e, "Skipping unknown frame"),
            Err(WireError::ConnectionClosed) => return AgentError::TunnelClosed,
            Err(e) => return e.into(),
        }
    }
}

async fn dispatch(shared: &Shared, msg: Message) {
    match msg {
        Message::Data {
            header, payload, ..
        } => {
            if let Some(reply) = shared.handler.handle_data(header.sender, payload).await {
                let out = Outbound::Reply {
                    recipient: header.sender,
                    seq: header.seq,
                    payload: reply,
                };
                if shared.outbound.send(out).await.is_err() {
                    debug!("Agent closed before reply could be queued");
                }
            }
        }
        Message::DataReply {
            header, payload, ..
        } => {
            if !shared
                .waiting
                .complete(header.sender, header.seq, Unlock::Reply(payload))
            {
                debug!(
                    sender = %header.sender,
                    seq = header.seq,
                    "Reply with no pending request"
                );
            }
        }
        Message::HeartbeatAck { .. } => {}
        Message::Error {
            header,
            code,
            detail,
        } => {
            match code {
                ErrorCode::DisconnectionBroadcast => {
                    shared
                        .waiting
                        .fail_recipient(header.sender, Unlock::RemoteDisconnected);
                }
                ErrorCode::UnknownRecipient => {
                    shared
                        .waiting
                        .complete(header.sender, header.seq, Unlock::UnknownRecipient);
                }
                ErrorCode::RecipientOverloaded => {
                    shared
                        .waiting
                        .complete(header.sender, header.seq, Unlock::Overloaded);
                }
                _ => warn!(code = %code, detail = %detail, "Router reported a fault"),
            }
            let notification = ErrorNotification {
                code,
                agent: header.sender,
                seq: header.seq,
                detail,
            };
            shared.handler.handle_error(&notification).await;
        }
        other => {
            debug!(message_type = %other.message_type(), "Ignoring unexpected message");
        }
    }
}
