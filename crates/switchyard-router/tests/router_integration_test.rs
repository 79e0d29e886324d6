//! Integration tests for the router over real TCP sockets.
//!
//! Clients here speak the wire protocol by hand so that malformed and
//! out-of-order traffic can be produced.

use bytes::Bytes;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use switchyard_router::{Router, SessionStatus};
use switchyard_types::{AgentId, MagicCookie, RouterConfig, RouterId};
use switchyard_wire::{
    read_frame, write_frame, write_message, ErrorCode, FrameBuffer, Message, WireError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const MAX: u32 = 64 * 1024;

// ---------------------------------------------------------------------------
// Raw protocol client
// ---------------------------------------------------------------------------

struct RawClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    frames: FrameBuffer,
    id: AgentId,
    cookie: MagicCookie,
    router_id: RouterId,
    seq: u64,
}

impl RawClient {
    async fn open(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer,
            frames: FrameBuffer::new(MAX),
            id: AgentId::INVALID,
            cookie: MagicCookie::NONE,
            router_id: RouterId::UNKNOWN,
            seq: 0,
        }
    }

    async fn register(addr: SocketAddr) -> Self {
        let mut client = Self::open(addr).await;
        client.send(&Message::registration_request(1, None)).await;
        match client.recv().await {
            Message::RegistrationReply {
                agent_id,
                cookie,
                router_id,
                ..
            } => {
                client.id = agent_id;
                client.cookie = cookie;
                client.router_id = router_id;
            }
            other => panic!("Expected RegistrationReply, got {other:?}"),
        }
        client
    }

    async fn send(&mut self, msg: &Message) {
        write_message(&mut self.writer, msg, MAX).await.unwrap();
    }

    async fn send_data(&mut self, to: AgentId, payload: &'static [u8]) -> u64 {
        self.seq += 1;
        let msg = Message::data(self.id, self.seq, to, Bytes::from_static(payload));
        self.send(&msg).await;
        self.seq
    }

    async fn try_recv(&mut self) -> Result<Message, WireError> {
        tokio::time::timeout(
            Duration::from_secs(5),
            read_frame(&mut self.reader, &mut self.frames),
        )
        .await
        .expect("timed out waiting for a frame")
        .map(|f| f.message)
    }

    async fn recv(&mut self) -> Message {
        self.try_recv().await.unwrap()
    }

    /// Next message that is not a disconnection broadcast.
    async fn recv_skip_broadcasts(&mut self) -> Message {
        loop {
            match self.recv().await {
                Message::Error {
                    code: ErrorCode::DisconnectionBroadcast,
                    ..
                } => continue,
                other => return other,
            }
        }
    }

    async fn expect_closed(&mut self) {
        loop {
            match self.try_recv().await {
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    }
}

fn test_config() -> RouterConfig {
    RouterConfig::default()
        .with_bind("127.0.0.1:0".parse().unwrap())
        .with_heartbeat_timeout_ms(2_000)
        .with_eviction_timeout_ms(8_000)
        .with_max_payload_size(MAX)
}

async fn start(config: RouterConfig) -> Arc<Router> {
    let (router, _task) = Router::start(config, None).await.unwrap();
    router
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_registration_assigns_unique_ids() {
    let router = start(test_config()).await;
    let a = RawClient::register(router.local_addr()).await;
    let b = RawClient::register(router.local_addr()).await;

    assert_ne!(a.id, b.id);
    assert!(!a.id.is_invalid() && !a.id.is_reserved());
    assert!(!a.cookie.is_none());
    assert_eq!(a.router_id, router.router_id());
    assert_eq!(router.registry().len(), 2);
    assert_eq!(router.registry().connected_count(), 2);
}

#[tokio::test]
async fn test_registration_reply_advertises_heartbeat_timeout() {
    let router = start(test_config()).await;
    let mut c = RawClient::open(router.local_addr()).await;
    c.send(&Message::registration_request(9, None)).await;
    match c.recv().await {
        Message::RegistrationReply {
            header,
            heartbeat_timeout_ms,
            ..
        } => {
            assert_eq!(header.seq, 9);
            assert_eq!(heartbeat_timeout_ms, 2_000);
        }
        other => panic!("Expected RegistrationReply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_wrong_cookie_rejected_without_mutation() {
    let router = start(test_config()).await;
    let owner = RawClient::register(router.local_addr()).await;

    let mut intruder = RawClient::open(router.local_addr()).await;
    let forged = Some((owner.id, MagicCookie::random(), owner.router_id));
    intruder
        .send(&Message::registration_request(1, forged))
        .await;
    match intruder.recv().await {
        Message::Error { code, header, .. } => {
            assert_eq!(code, ErrorCode::WrongMagicCookie);
            assert_eq!(header.sender, owner.id);
        }
        other => panic!("Expected WrongMagicCookie, got {other:?}"),
    }
    intruder.expect_closed().await;

    let session = router.registry().get(owner.id).unwrap();
    assert!(session.cookie_matches(&owner.cookie));
    assert_eq!(session.status(), SessionStatus::Connected);
    assert_eq!(router.registry().len(), 1);
}

#[tokio::test]
async fn test_foreign_router_id_rejected() {
    let router = start(test_config()).await;
    let owner = RawClient::register(router.local_addr()).await;

    let mut c = RawClient::open(router.local_addr()).await;
    let stale = Some((owner.id, owner.cookie, RouterId(router.router_id().0 ^ 1)));
    c.send(&Message::registration_request(1, stale)).await;
    match c.recv().await {
        Message::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRouterId),
        other => panic!("Expected InvalidRouterId, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_claimed_id_rejected() {
    let router = start(test_config()).await;
    let mut c = RawClient::open(router.local_addr()).await;
    let claim = Some((AgentId(999_999), MagicCookie::random(), router.router_id()));
    c.send(&Message::registration_request(1, claim)).await;
    match c.recv().await {
        Message::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidAgentId),
        other => panic!("Expected InvalidAgentId, got {other:?}"),
    }
    assert!(router.registry().is_empty());
}

#[tokio::test]
async fn test_message_before_registration_is_malformed() {
    let router = start(test_config()).await;
    let mut c = RawClient::open(router.local_addr()).await;
    c.send(&Message::heartbeat(AgentId(5000), 3)).await;
    match c.recv().await {
        Message::Error { code, header, .. } => {
            assert_eq!(code, ErrorCode::MalformedMessage);
            assert_eq!(header.seq, 3);
        }
        other => panic!("Expected MalformedMessage, got {other:?}"),
    }
    c.expect_closed().await;
    assert!(router.registry().is_empty());
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_data_forwarded_in_order() {
    let router = start(test_config()).await;
    let mut a = RawClient::register(router.local_addr()).await;
    let mut b = RawClient::register(router.local_addr()).await;

    let s1 = a.send_data(b.id, b"M1").await;
    let s2 = a.send_data(b.id, b"M2").await;

    for (expected_seq, expected) in [(s1, &b"M1"[..]), (s2, &b"M2"[..])] {
        match b.recv().await {
            Message::Data {
                header,
                recipient,
                payload,
            } => {
                assert_eq!(header.sender, a.id);
                assert_eq!(header.seq, expected_seq);
                assert_eq!(recipient, b.id);
                assert_eq!(&payload[..], expected);
            }
            other => panic!("Expected Data, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_data_reply_forwarded() {
    let router = start(test_config()).await;
    let mut a = RawClient::register(router.local_addr()).await;
    let mut b = RawClient::register(router.local_addr()).await;

    let seq = a.send_data(b.id, b"ping").await;
    let _ = b.recv().await;
    b.send(&Message::data_reply(b.id, seq, a.id, Bytes::from_static(b"pong")))
        .await;
    match a.recv().await {
        Message::DataReply {
            header, payload, ..
        } => {
            assert_eq!(header.sender, b.id);
            assert_eq!(header.seq, seq);
            assert_eq!(&payload[..], b"pong");
        }
        other => panic!("Expected DataReply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_recipient_notified() {
    let router = start(test_config()).await;
    let mut a = RawClient::register(router.local_addr()).await;
    let seq = a.send_data(AgentId(123_456), b"hello?").await;
    match a.recv().await {
        Message::Error { header, code, .. } => {
            assert_eq!(code, ErrorCode::UnknownRecipient);
            assert_eq!(header.sender, AgentId(123_456));
            assert_eq!(header.seq, seq);
        }
        other => panic!("Expected UnknownRecipient, got {other:?}"),
    }
}

#[tokio::test]
async fn test_forged_sender_closes_connection() {
    let router = start(test_config()).await;
    let mut a = RawClient::register(router.local_addr()).await;
    let b = RawClient::register(router.local_addr()).await;
    a.send(&Message::data(b.id, 1, b.id, Bytes::from_static(b"spoof")))
        .await;
    match a.recv().await {
        Message::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidAgentId),
        other => panic!("Expected InvalidAgentId, got {other:?}"),
    }
    a.expect_closed().await;
}

#[tokio::test]
async fn test_heartbeat_acknowledged() {
    let router = start(test_config()).await;
    let mut a = RawClient::register(router.local_addr()).await;
    a.send(&Message::heartbeat(a.id, 42)).await;
    match a.recv().await {
        Message::HeartbeatAck { header } => assert_eq!(header.seq, 42),
        other => panic!("Expected HeartbeatAck, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Disconnection and reconnection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_disconnect_keeps_session_and_broadcasts() {
    let router = start(test_config()).await;
    let mut a = RawClient::register(router.local_addr()).await;
    let mut b = RawClient::register(router.local_addr()).await;

    b.send(&Message::disconnect(b.id, 1)).await;
    match a.recv().await {
        Message::Error { header, code, .. } => {
            assert_eq!(code, ErrorCode::DisconnectionBroadcast);
            assert_eq!(header.sender, b.id);
        }
        other => panic!("Expected DisconnectionBroadcast, got {other:?}"),
    }
    b.expect_closed().await;

    let session = router.registry().get(b.id).unwrap();
    assert_eq!(session.status(), SessionStatus::PendingEviction);
}

#[tokio::test]
async fn test_reconnect_with_cookie_receives_buffered_frames() {
    let router = start(test_config()).await;
    let mut a = RawClient::register(router.local_addr()).await;
    let mut b = RawClient::register(router.local_addr()).await;
    let (b_id, b_cookie, rid) = (b.id, b.cookie, b.router_id);

    b.writer.shutdown().await.unwrap();
    drop(b);
    let _ = a.recv().await; // disconnection broadcast
    a.send_data(b_id, b"while-away-1").await;
    a.send_data(b_id, b"while-away-2").await;
    settle().await;
    assert_eq!(router.registry().get(b_id).unwrap().pending_len(), 2);

    let mut b2 = RawClient::open(router.local_addr()).await;
    b2.send(&Message::registration_request(1, Some((b_id, b_cookie, rid))))
        .await;
    match b2.recv().await {
        Message::RegistrationReply { agent_id, .. } => assert_eq!(agent_id, b_id),
        other => panic!("Expected RegistrationReply, got {other:?}"),
    }
    for expected in [&b"while-away-1"[..], &b"while-away-2"[..]] {
        match b2.recv().await {
            Message::Data { payload, .. } => assert_eq!(&payload[..], expected),
            other => panic!("Expected buffered Data, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_reconnect_supersedes_live_connection() {
    let router = start(test_config()).await;
    let mut b = RawClient::register(router.local_addr()).await;

    let mut b2 = RawClient::open(router.local_addr()).await;
    b2.send(&Message::registration_request(
        1,
        Some((b.id, b.cookie, b.router_id)),
    ))
    .await;
    assert!(matches!(b2.recv().await, Message::RegistrationReply { .. }));
    b.expect_closed().await;

    b2.send(&Message::heartbeat(b.id, 5)).await;
    assert!(matches!(b2.recv().await, Message::HeartbeatAck { .. }));
    assert_eq!(
        router.registry().get(b.id).unwrap().status(),
        SessionStatus::Connected
    );
}

#[tokio::test]
async fn test_pending_buffer_overflow_rejects() {
    let config = test_config().with_queue_capacity(2);
    let router = start(config).await;
    let mut a = RawClient::register(router.local_addr()).await;
    let b = RawClient::register(router.local_addr()).await;
    let b_id = b.id;
    drop(b);
    let _ = a.recv().await; // disconnection broadcast

    a.send_data(b_id, b"1").await;
    a.send_data(b_id, b"2").await;
    let third = a.send_data(b_id, b"3").await;
    match a.recv_skip_broadcasts().await {
        Message::Error { header, code, .. } => {
            assert_eq!(code, ErrorCode::RecipientOverloaded);
            assert_eq!(header.seq, third);
        }
        other => panic!("Expected RecipientOverloaded, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Fault isolation and limits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_malformed_frame_closes_only_that_connection() {
    let router = start(test_config()).await;
    let mut a = RawClient::register(router.local_addr()).await;
    let mut b = RawClient::register(router.local_addr()).await;
    let mut bad = RawClient::register(router.local_addr()).await;

    // Declared length shorter than the header.
    write_frame(&mut bad.writer, &[0, 0, 0, 3, 1, 2, 0, 0, 0])
        .await
        .unwrap();
    match bad.recv().await {
        Message::Error { code, .. } => assert_eq!(code, ErrorCode::MalformedMessage),
        other => panic!("Expected MalformedMessage, got {other:?}"),
    }
    bad.expect_closed().await;

    a.send_data(b.id, b"still alive").await;
    match b.recv_skip_broadcasts().await {
        Message::Data { payload, .. } => assert_eq!(&payload[..], b"still alive"),
        other => panic!("Expected Data, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connection_limit() {
    let router = start(test_config().with_max_connections(1)).await;
    let _a = RawClient::register(router.local_addr()).await;
    let mut refused = RawClient::open(router.local_addr()).await;
    assert!(refused.try_recv().await.is_err());
    assert_eq!(router.active_connections(), 1);
}

#[tokio::test]
async fn test_idle_client_disconnected_then_evicted() {
    let config = test_config()
        .with_heartbeat_timeout_ms(300)
        .with_eviction_timeout_ms(600);
    let router = start(config).await;
    let mut a = RawClient::register(router.local_addr()).await;
    let id = a.id;

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(
        router.registry().get(id).unwrap().status(),
        SessionStatus::PendingEviction
    );
    a.expect_closed().await;

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(router.registry().get(id).is_none());

    let mut late = RawClient::open(router.local_addr()).await;
    late.send(&Message::registration_request(
        1,
        Some((id, a.cookie, a.router_id)),
    ))
    .await;
    match late.recv().await {
        Message::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidAgentId),
        other => panic!("Expected InvalidAgentId, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Reserved agents and reload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reserved_agent_claim_and_reload() {
    let admin = MagicCookie::random();
    let first = MagicCookie::random();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "admin_cookie = \"{}\"\n\n[[reserved]]\nid = 7\ncookie = \"{}\"\n",
        admin.to_hex(),
        first.to_hex()
    )
    .unwrap();
    file.flush().unwrap();

    let mut config = test_config();
    config.admin_cookie = Some(admin);
    config.reserved = vec![switchyard_types::ReservedAgent {
        id: AgentId(7),
        cookie: first,
    }];
    let (router, _task) = Router::start(config, Some(file.path().to_path_buf()))
        .await
        .unwrap();

    // Claim the reserved identity without knowing the router id.
    let mut r = RawClient::open(router.local_addr()).await;
    r.send(&Message::registration_request(
        1,
        Some((AgentId(7), first, RouterId::UNKNOWN)),
    ))
    .await;
    match r.recv().await {
        Message::RegistrationReply { agent_id, .. } => assert_eq!(agent_id, AgentId(7)),
        other => panic!("Expected RegistrationReply, got {other:?}"),
    }

    // Drop id 7, add id 8, then ask the router to reload.
    let second = MagicCookie::random();
    let rewritten = format!(
        "admin_cookie = \"{}\"\n\n[[reserved]]\nid = 8\ncookie = \"{}\"\n",
        admin.to_hex(),
        second.to_hex()
    );
    std::fs::write(file.path(), rewritten).unwrap();

    let mut admin_conn = RawClient::open(router.local_addr()).await;
    admin_conn.send(&Message::reload_config(1, admin)).await;
    settle().await;

    assert!(router.registry().get(AgentId(7)).is_none());
    assert!(router
        .registry()
        .get(AgentId(8))
        .unwrap()
        .cookie_matches(&second));
    r.expect_closed().await;
}

#[tokio::test]
async fn test_reload_with_wrong_admin_cookie_ignored() {
    let admin = MagicCookie::random();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "admin_cookie = \"{}\"", admin.to_hex()).unwrap();

    let mut config = test_config();
    config.admin_cookie = Some(admin);
    config.reserved = vec![switchyard_types::ReservedAgent {
        id: AgentId(3),
        cookie: MagicCookie::random(),
    }];
    let (router, _task) = Router::start(config, Some(file.path().to_path_buf()))
        .await
        .unwrap();

    let mut c = RawClient::open(router.local_addr()).await;
    c.send(&Message::reload_config(1, MagicCookie::random())).await;
    settle().await;
    assert!(router.registry().get(AgentId(3)).is_some());
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let (router, task) = Router::start(test_config(), None).await.unwrap();
    let mut a = RawClient::register(router.local_addr()).await;
    router.shutdown();
    task.await.unwrap();
    a.expect_closed().await;
    assert!(router.is_shutting_down());
}
