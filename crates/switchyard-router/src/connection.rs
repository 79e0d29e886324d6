//! Per-connection protocol handling.
//!
//! Each accepted socket gets a reader task (this module's [`serve`]) and,
//! once registered, a writer task draining the session's outbound queue.
//! The reader runs the connection state machine:
//!
//! - **awaiting registration**: only `RegistrationRequest` (or an admin
//!   `ReloadConfig`) is accepted, within one heartbeat timeout;
//! - **active**: data is forwarded, heartbeats are acknowledged, and
//!   `Disconnect` / EOF ends the connection but keeps the session.
//!
//! A protocol violation closes this connection only.

use crate::error::{RouterError, RouterResult};
use crate::router::Router;
use crate::session::{ClientSession, Delivery, Link};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchyard_types::AgentId;
use switchyard_wire::{
    encode, read_frame, write_frame, write_message, ErrorCode, Frame, FrameBuffer, Message,
    WireError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How long the writer may keep flushing after the reader has finished.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum Flow {
    Continue,
    Close,
}

/// Serve one accepted connection until it ends.
pub(crate) async fn serve(router: Arc<Router>, stream: TcpStream, addr: SocketAddr) {
    let conn_id = router.next_conn_id();
    match handle(&router, stream, addr, conn_id).await {
        Ok(()) => debug!(peer = %addr, conn_id, "Connection closed"),
        Err(e) => debug!(peer = %addr, conn_id, error = %e, "Connection ended"),
    }
}

async fn handle(
    router: &Arc<Router>,
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: u64,
) -> RouterResult<()> {
    let config = router.config();
    let max = config.max_payload_size;
    let (mut reader, mut writer) = stream.into_split();
    let mut frames = FrameBuffer::new(max);

    let first = match tokio::time::timeout(
        config.heartbeat_timeout(),
        read_frame(&mut reader, &mut frames),
    )
    .await
    {
        Err(_) => return Err(RouterError::RegistrationTimeout),
        Ok(Err(WireError::Codec(e))) => {
            let msg = Message::error(
                AgentId::INVALID,
                0,
                ErrorCode::MalformedMessage,
                e.to_string(),
            );
            let _ = write_message(&mut writer, &msg, max).await;
            return Err(WireError::Codec(e).into());
        }
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(frame)) => frame,
    };

    let (seq, requested, cookie, presented_router) = match first.message {
        Message::RegistrationRequest {
            header,
            requested_id,
            cookie,
            router_id,
        } => (header.seq, requested_id, cookie, router_id),
        Message::ReloadConfig { admin_cookie, .. } => {
            router.handle_reload(&admin_cookie, addr);
            return Ok(());
        }
        other => {
            let msg = Message::error(
                other.sender(),
                other.seq(),
                ErrorCode::MalformedMessage,
                "registration required",
            );
            let _ = write_message(&mut writer, &msg, max).await;
            return Err(RouterError::Protocol(format!(
                "expected registration, got {}",
                other.message_type()
            )));
        }
    };

    let (tx, rx) = mpsc::channel::<Bytes>(config.outbound_queue_capacity);
    let (close_tx, close_rx) = watch::channel(false);
    let close_tx = Arc::new(close_tx);
    let link = Link::new(conn_id, tx.clone(), Arc::clone(&close_tx));

    let session = match router.register(requested, cookie, presented_router, link) {
        Ok(session) => session,
        Err(code) => {
            let detail = format!("registration of {requested} refused");
            let msg = Message::error(requested, seq, code, detail);
            let _ = write_message(&mut writer, &msg, max).await;
            return Err(RouterError::Rejected { code });
        }
    };
    let agent_id = session.id();

    // The reply goes out before the writer task starts, so it precedes any
    // frame already queued for this session.
    let reply = Message::registration_reply(
        seq,
        agent_id,
        *session.cookie(),
        router.router_id(),
        config.heartbeat_timeout_ms as u32,
    );
    if let Err(e) = write_message(&mut writer, &reply, max).await {
        if session.detach(conn_id, router.now_ms()) {
            router.broadcast_disconnection(agent_id);
        }
        return Err(e.into());
    }

    if requested.is_invalid() {
        info!(agent_id = %agent_id, peer = %addr, "Agent registered");
    } else {
        info!(agent_id = %agent_id, peer = %addr, "Agent reconnected");
    }

    let writer_task = tokio::spawn(write_loop(writer, rx, Arc::clone(&close_tx)));
    let conn = Conn {
        router,
        session: &session,
        addr,
        tx,
    };
    let result = conn.read_loop(&mut reader, &mut frames, close_rx).await;

    if session.detach(conn_id, router.now_ms()) {
        info!(agent_id = %agent_id, "Agent disconnected");
        router.broadcast_disconnection(agent_id);
    }

    // Once the session has let go of the link, dropping our sender lets the
    // writer drain what is queued and stop.
    drop(conn);
    if tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await.is_err() {
        debug!(agent_id = %agent_id, "Writer did not drain in time");
        close_tx.send_replace(true);
    }
    result
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    close: Arc<watch::Sender<bool>>,
) {
    let mut closed = close.subscribe();
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => frame,
            _ = closed.wait_for(|c| *c) => break,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "Write failed, closing connection");
            close.send_replace(true);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// A registered connection as seen by its reader.
struct Conn<'a> {
    router: &'a Router,
    session: &'a ClientSession,
    addr: SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

impl Conn<'_> {
    async fn read_loop(
        &self,
        reader: &mut OwnedReadHalf,
        frames: &mut FrameBuffer,
        mut closed: watch::Receiver<bool>,
    ) -> RouterResult<()> {
        loop {
            let read = tokio::select! {
                res = read_frame(reader, frames) => res,
                _ = closed.wait_for(|c| *c) => return Ok(()),
            };
            let frame = match read {
                Ok(frame) => frame,
                Err(WireError::ConnectionClosed) => return Ok(()),
                Err(WireError::Codec(e)) => {
                    warn!(
                        agent_id = %self.session.id(),
                        error = %e,
                        "Malformed frame, closing connection"
                    );
                    let msg = Message::error(
                        self.session.id(),
                        0,
                        ErrorCode::MalformedMessage,
                        e.to_string(),
                    );
                    if let Ok(bytes) = encode(&msg, self.max_payload()) {
                        let _ = self.tx.try_send(bytes);
                    }
                    return Err(WireError::Codec(e).into());
                }
                Err(e) => return Err(e.into()),
            };

            self.session.touch(self.router.now_ms());
            if let Flow::Close = self.dispatch(frame).await {
                return Ok(());
            }
        }
    }

    fn max_payload(&self) -> u32 {
        self.router.config().max_payload_size
    }

    async fn dispatch(&self, frame: Frame) -> Flow {
        let Frame { message, raw } = frame;
        match message {
            Message::Data {
                header, recipient, ..
            }
            | Message::DataReply {
                header, recipient, ..
            } => {
                if header.sender != self.session.id() {
                    warn!(
                        agent_id = %self.session.id(),
                        claimed = %header.sender,
                        "Data with forged sender, closing connection"
                    );
                    self.reply_error(
                        header.sender,
                        header.seq,
                        ErrorCode::InvalidAgentId,
                        "sender does not match registration",
                    )
                    .await;
                    return Flow::Close;
                }
                self.forward(header.seq, recipient, raw).await
            }
            Message::Heartbeat { header } => {
                match encode(&Message::heartbeat_ack(header.seq), self.max_payload()) {
                    Ok(ack) => self.send_own(ack).await,
                    Err(_) => Flow::Close,
                }
            }
            Message::Disconnect { .. } => {
                debug!(agent_id = %self.session.id(), "Agent requested disconnect");
                Flow::Close
            }
            Message::ReloadConfig { admin_cookie, .. } => {
                self.router.handle_reload(&admin_cookie, self.addr);
                Flow::Continue
            }
            other => {
                warn!(
                    agent_id = %self.session.id(),
                    message_type = %other.message_type(),
                    "Unexpected message from registered agent, closing connection"
                );
                self.reply_error(
                    other.sender(),
                    other.seq(),
                    ErrorCode::MalformedMessage,
                    "unexpected message type",
                )
                .await;
                Flow::Close
            }
        }
    }

    /// Route a data frame, unchanged, to its recipient.
    async fn forward(&self, seq: u64, recipient: AgentId, raw: Bytes) -> Flow {
        let Some(target) = self.router.registry().get(recipient) else {
            debug!(recipient = %recipient, "Data for unknown recipient");
            return self
                .reply_error(recipient, seq, ErrorCode::UnknownRecipient, "unknown recipient")
                .await;
        };
        match target.deliver(raw, self.router.now_ms()) {
            Delivery::Sent | Delivery::Buffered => Flow::Continue,
            Delivery::Detached => {
                info!(agent_id = %recipient, "Agent disconnected");
                self.router.broadcast_disconnection(recipient);
                Flow::Continue
            }
            Delivery::Overloaded => {
                debug!(recipient = %recipient, "Recipient queue full, rejecting frame");
                self.reply_error(
                    recipient,
                    seq,
                    ErrorCode::RecipientOverloaded,
                    "recipient queue full",
                )
                .await
            }
            Delivery::Gone => {
                self.reply_error(recipient, seq, ErrorCode::UnknownRecipient, "recipient evicted")
                    .await
            }
        }
    }

    async fn reply_error(&self, subject: AgentId, seq: u64, code: ErrorCode, detail: &str) -> Flow {
        match encode(&Message::error(subject, seq, code, detail), self.max_payload()) {
            Ok(frame) => self.send_own(frame).await,
            Err(_) => Flow::Close,
        }
    }

    /// Queue a frame for this connection's own client, waiting for room.
    async fn send_own(&self, frame: Bytes) -> Flow {
        match self.tx.send(frame).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Close,
        }
    }
}
