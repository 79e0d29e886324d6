//! Client sessions, one per registered agent id.
//!
//! A [`ClientSession`] outlives the TCP connections that serve it. Its
//! lifecycle is an explicit state machine:
//!
//! ```text
//!   Connected ──(EOF / Disconnect / idle > H)──▶ PendingEviction
//!       ▲                                           │      │
//!       └────────(re-registration with cookie)──────┘      │
//!                                                 (> E, not reserved)
//!                                                          ▼
//!                                                       Evicted
//! ```
//!
//! `Evicted` is terminal. All transitions happen under the session mutex,
//! which is never held across an `.await`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use switchyard_types::{AgentId, MagicCookie};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Handle on the connection currently serving a session.
#[derive(Debug, Clone)]
pub struct Link {
    conn_id: u64,
    tx: mpsc::Sender<Bytes>,
    close: Arc<watch::Sender<bool>>,
}

impl Link {
    pub fn new(conn_id: u64, tx: mpsc::Sender<Bytes>, close: Arc<watch::Sender<bool>>) -> Self {
        Self { conn_id, tx, close }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Ask the connection's reader and writer to stop.
    pub fn close(&self) {
        self.close.send_replace(true);
    }
}

/// Session state. See the module docs for the transitions.
#[derive(Debug)]
pub enum SessionState {
    Connected(Link),
    PendingEviction {
        /// Router clock time the session lost its connection.
        since_ms: u64,
        /// Frames addressed to the session while it was away.
        pending: VecDeque<Bytes>,
    },
    Evicted,
}

/// Field-less view of [`SessionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    PendingEviction,
    Evicted,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::PendingEviction => write!(f, "pending_eviction"),
            Self::Evicted => write!(f, "evicted"),
        }
    }
}

/// Outcome of handing a frame to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the live connection.
    Sent,
    /// Held until the client reconnects.
    Buffered,
    /// The connection turned out to be dead. The session moved to
    /// `PendingEviction` and the frame was buffered.
    Detached,
    /// Queue full; the frame was not accepted.
    Overloaded,
    /// The session has been evicted.
    Gone,
}

/// Returned by [`ClientSession::attach`] on an evicted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEvicted;

/// A registered agent identity.
#[derive(Debug)]
pub struct ClientSession {
    id: AgentId,
    cookie: MagicCookie,
    reserved: bool,
    registered_at: DateTime<Utc>,
    last_activity_ms: AtomicU64,
    capacity: usize,
    state: Mutex<SessionState>,
}

impl ClientSession {
    /// A session freshly registered over `link`.
    pub fn connected(
        id: AgentId,
        cookie: MagicCookie,
        link: Link,
        now_ms: u64,
        capacity: usize,
    ) -> Self {
        Self {
            id,
            cookie,
            reserved: id.is_reserved(),
            registered_at: Utc::now(),
            last_activity_ms: AtomicU64::new(now_ms),
            capacity,
            state: Mutex::new(SessionState::Connected(link)),
        }
    }

    /// A reserved identity installed from configuration, waiting for its
    /// first client. Reserved sessions are never evicted by the sweeper.
    pub fn reserved(id: AgentId, cookie: MagicCookie, now_ms: u64, capacity: usize) -> Self {
        Self {
            id,
            cookie,
            reserved: true,
            registered_at: Utc::now(),
            last_activity_ms: AtomicU64::new(now_ms),
            capacity,
            state: Mutex::new(SessionState::PendingEviction {
                since_ms: now_ms,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn cookie(&self) -> &MagicCookie {
        &self.cookie
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Wall-clock time since the session was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.registered_at)
    }

    pub fn cookie_matches(&self, presented: &MagicCookie) -> bool {
        self.cookie.matches(presented)
    }

    /// Record activity at `now_ms`. Never moves the clock backwards.
    pub fn touch(&self, now_ms: u64) {
        self.last_activity_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> SessionStatus {
        match &*self.lock() {
            SessionState::Connected(_) => SessionStatus::Connected,
            SessionState::PendingEviction { .. } => SessionStatus::PendingEviction,
            SessionState::Evicted => SessionStatus::Evicted,
        }
    }

    /// Frames buffered while disconnected.
    pub fn pending_len(&self) -> usize {
        match &*self.lock() {
            SessionState::PendingEviction { pending, .. } => pending.len(),
            _ => 0,
        }
    }

    /// Bind the session to a new connection.
    ///
    /// Frames buffered while disconnected are moved onto the new link's
    /// queue first. Returns the previous link, if any, so the caller can
    /// close it.
    pub fn attach(&self, link: Link, now_ms: u64) -> Result<Option<Link>, SessionEvicted> {
        let mut state = self.lock();
        let previous = match std::mem::replace(&mut *state, SessionState::Evicted) {
            SessionState::Evicted => return Err(SessionEvicted),
            SessionState::Connected(old) => Some(old),
            SessionState::PendingEviction { pending, .. } => {
                let total = pending.len();
                for (i, frame) in pending.into_iter().enumerate() {
                    if link.tx.try_send(frame).is_err() {
                        warn!(
                            agent_id = %self.id,
                            dropped = total - i,
                            "Outbound queue refused buffered frames on reattach"
                        );
                        break;
                    }
                }
                if total > 0 {
                    debug!(agent_id = %self.id, frames = total, "Flushed buffered frames");
                }
                None
            }
        };
        // Touched under the lock so the sweeper never pairs the new link
        // with the idle time of the old one.
        self.touch(now_ms);
        *state = SessionState::Connected(link);
        Ok(previous)
    }

    /// The connection `conn_id` has ended.
    ///
    /// Returns `true` if this moved the session out of `Connected`; a stale
    /// connection replaced by a newer one changes nothing.
    pub fn detach(&self, conn_id: u64, now_ms: u64) -> bool {
        let mut state = self.lock();
        match &*state {
            SessionState::Connected(link) if link.conn_id == conn_id => {
                *state = SessionState::PendingEviction {
                    since_ms: now_ms,
                    pending: VecDeque::new(),
                };
                true
            }
            _ => false,
        }
    }

    /// Close the connection if nothing was received for longer than
    /// `timeout_ms`. Returns `true` if the session was disconnected.
    pub fn disconnect_if_idle(&self, now_ms: u64, timeout_ms: u64) -> bool {
        if now_ms.saturating_sub(self.last_activity_ms()) <= timeout_ms {
            return false;
        }
        let mut state = self.lock();
        // A reattach may have landed since the first read.
        if now_ms.saturating_sub(self.last_activity_ms()) <= timeout_ms {
            return false;
        }
        if let SessionState::Connected(link) = &*state {
            link.close();
            *state = SessionState::PendingEviction {
                since_ms: now_ms,
                pending: VecDeque::new(),
            };
            true
        } else {
            false
        }
    }

    /// Mark the session evicted if it has waited for a reconnection longer
    /// than `timeout_ms`. Reserved sessions never expire.
    pub fn evict_if_expired(&self, now_ms: u64, timeout_ms: u64) -> bool {
        if self.reserved {
            return false;
        }
        let mut state = self.lock();
        match &*state {
            SessionState::PendingEviction { since_ms, .. }
                if now_ms.saturating_sub(*since_ms) > timeout_ms =>
            {
                *state = SessionState::Evicted;
                true
            }
            _ => false,
        }
    }

    /// Unconditionally evict, closing any live connection.
    pub fn evict(&self) {
        let mut state = self.lock();
        if let SessionState::Connected(link) = &*state {
            link.close();
        }
        *state = SessionState::Evicted;
    }

    /// Hand a forwarded frame to this session.
    pub fn deliver(&self, frame: Bytes, now_ms: u64) -> Delivery {
        let mut state = self.lock();
        match &mut *state {
            SessionState::Connected(link) => match link.tx.try_send(frame) {
                Ok(()) => Delivery::Sent,
                Err(TrySendError::Full(_)) => Delivery::Overloaded,
                Err(TrySendError::Closed(frame)) => {
                    link.close();
                    *state = SessionState::PendingEviction {
                        since_ms: now_ms,
                        pending: VecDeque::from([frame]),
                    };
                    Delivery::Detached
                }
            },
            SessionState::PendingEviction { pending, .. } => {
                if pending.len() >= self.capacity {
                    Delivery::Overloaded
                } else {
                    pending.push_back(frame);
                    Delivery::Buffered
                }
            }
            SessionState::Evicted => Delivery::Gone,
        }
    }

    /// Queue a router-originated frame if the client is connected. Dropped
    /// otherwise, or when the queue is full.
    pub fn notify(&self, frame: Bytes) -> bool {
        match &*self.lock() {
            SessionState::Connected(link) => link.tx.try_send(frame).is_ok(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: usize = 4;

    fn link(conn_id: u64) -> (Link, mpsc::Receiver<Bytes>, watch::Receiver<bool>) {
        let (tx, rx) = mpsc::channel(CAP);
        let (close_tx, close_rx) = watch::channel(false);
        (Link::new(conn_id, tx, Arc::new(close_tx)), rx, close_rx)
    }

    fn session(conn_id: u64) -> (ClientSession, mpsc::Receiver<Bytes>, watch::Receiver<bool>) {
        let (l, rx, close) = link(conn_id);
        (
            ClientSession::connected(AgentId(5000), MagicCookie::random(), l, 0, CAP),
            rx,
            close,
        )
    }

    #[test]
    fn test_deliver_connected() {
        let (s, mut rx, _close) = session(1);
        assert_eq!(s.deliver(Bytes::from_static(b"a"), 0), Delivery::Sent);
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
    }

    #[test]
    fn test_overflow_rejects_new_frames() {
        let (s, mut rx, _close) = session(1);
        for i in 0..CAP {
            assert_eq!(s.deliver(Bytes::from(vec![i as u8]), 0), Delivery::Sent);
        }
        assert_eq!(s.deliver(Bytes::from_static(b"x"), 0), Delivery::Overloaded);
        // Already queued frames are intact and in order.
        for i in 0..CAP {
            assert_eq!(rx.try_recv().unwrap(), Bytes::from(vec![i as u8]));
        }
    }

    #[test]
    fn test_detach_buffers_then_reattach_flushes() {
        let (s, _rx, _close) = session(1);
        assert!(s.detach(1, 100));
        assert_eq!(s.status(), SessionStatus::PendingEviction);
        assert_eq!(s.deliver(Bytes::from_static(b"m1"), 110), Delivery::Buffered);
        assert_eq!(s.deliver(Bytes::from_static(b"m2"), 120), Delivery::Buffered);
        assert_eq!(s.pending_len(), 2);

        let (l2, mut rx2, _c2) = link(2);
        assert!(s.attach(l2, 200).unwrap().is_none());
        assert_eq!(s.status(), SessionStatus::Connected);
        assert_eq!(rx2.try_recv().unwrap(), Bytes::from_static(b"m1"));
        assert_eq!(rx2.try_recv().unwrap(), Bytes::from_static(b"m2"));
        assert_eq!(s.last_activity_ms(), 200);
    }

    #[test]
    fn test_pending_buffer_is_bounded() {
        let (s, _rx, _close) = session(1);
        s.detach(1, 0);
        for _ in 0..CAP {
            assert_eq!(s.deliver(Bytes::new(), 0), Delivery::Buffered);
        }
        assert_eq!(s.deliver(Bytes::new(), 0), Delivery::Overloaded);
    }

    #[test]
    fn test_stale_detach_ignored() {
        let (s, _rx, close1) = session(1);
        let (l2, _rx2, _c2) = link(2);
        let old = s.attach(l2, 10).unwrap().unwrap();
        assert_eq!(old.conn_id(), 1);
        old.close();
        assert!(*close1.borrow());
        assert!(!s.detach(1, 20));
        assert_eq!(s.status(), SessionStatus::Connected);
        assert!(s.detach(2, 20));
    }

    #[test]
    fn test_idle_disconnect_closes_link() {
        let (s, _rx, close) = session(1);
        s.touch(1_000);
        assert!(!s.disconnect_if_idle(1_500, 500));
        assert!(s.disconnect_if_idle(1_501, 500));
        assert!(*close.borrow());
        assert_eq!(s.status(), SessionStatus::PendingEviction);
        assert!(!s.disconnect_if_idle(9_999, 500));
    }

    #[test]
    fn test_eviction_after_timeout_only() {
        let (s, _rx, _close) = session(1);
        s.detach(1, 1_000);
        assert!(!s.evict_if_expired(2_000, 1_000));
        assert!(s.evict_if_expired(2_001, 1_000));
        assert_eq!(s.status(), SessionStatus::Evicted);
        assert_eq!(s.deliver(Bytes::new(), 2_002), Delivery::Gone);
        let (l, _rx2, _c2) = link(2);
        assert!(matches!(s.attach(l, 2_003), Err(SessionEvicted)));
    }

    #[test]
    fn test_connected_session_never_expires() {
        let (s, _rx, _close) = session(1);
        assert!(!s.evict_if_expired(u64::MAX, 0));
    }

    #[test]
    fn test_reserved_never_expires() {
        let s = ClientSession::reserved(AgentId(7), MagicCookie::random(), 0, CAP);
        assert!(s.is_reserved());
        assert_eq!(s.status(), SessionStatus::PendingEviction);
        assert!(!s.evict_if_expired(u64::MAX, 0));
    }

    #[test]
    fn test_dead_writer_detaches_on_delivery() {
        let (s, rx, close) = session(1);
        drop(rx);
        assert_eq!(s.deliver(Bytes::from_static(b"late"), 50), Delivery::Detached);
        assert!(*close.borrow());
        assert_eq!(s.status(), SessionStatus::PendingEviction);
        assert_eq!(s.pending_len(), 1);
    }

    #[test]
    fn test_notify_only_when_connected() {
        let (s, mut rx, _close) = session(1);
        assert!(s.notify(Bytes::from_static(b"ack")));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"ack"));
        s.detach(1, 0);
        assert!(!s.notify(Bytes::from_static(b"ack")));
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let (s, _rx, _close) = session(1);
        s.touch(500);
        s.touch(100);
        assert_eq!(s.last_activity_ms(), 500);
    }

    #[test]
    fn test_age_counts_from_registration() {
        let before = Utc::now();
        let (s, _rx, _close) = session(1);
        assert!(s.registered_at() >= before);
        assert!(s.registered_at() <= Utc::now());
        assert!(s.age() >= chrono::Duration::zero());
    }

    #[test]
    fn test_reattach_after_long_silence_survives_sweep() {
        let (s, _rx, _close) = session(1);
        s.detach(1, 1_000);
        // Reattach long after the last activity; the sweep that follows at
        // the same instant must keep the new link.
        let (l, _rx2, close2) = link(2);
        assert!(s.attach(l, 60_000).unwrap().is_none());
        assert_eq!(s.last_activity_ms(), 60_000);
        assert!(!s.disconnect_if_idle(60_000, 500));
        assert!(!*close2.borrow());
        assert_eq!(s.status(), SessionStatus::Connected);
    }

    #[test]
    fn test_concurrent_reattach_and_sweep_keep_fresh_link() {
        for round in 0..200u64 {
            let (s, _rx, _close) = session(1);
            let s = Arc::new(s);
            s.detach(1, 0);
            let now = 10_000 + round;
            let (l, _rx2, close2) = link(2);

            let sweeper = {
                let s = Arc::clone(&s);
                std::thread::spawn(move || s.disconnect_if_idle(now, 500))
            };
            s.attach(l, now).unwrap();
            let swept = sweeper.join().unwrap();

            assert!(!swept, "round {round}: fresh link was swept");
            assert!(!*close2.borrow());
            assert_eq!(s.status(), SessionStatus::Connected);
        }
    }
}
