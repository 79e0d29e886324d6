//! Pending requests awaiting a reply.
//!
//! A request is keyed by `(recipient, sequence)`, which is exactly what the
//! matching `DataReply` (sender, sequence) or error notification carries.

use bytes::Bytes;
use dashmap::DashMap;
use switchyard_types::AgentId;
use tokio::sync::oneshot;

/// How a pending request was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Unlock {
    Reply(Bytes),
    UnknownRecipient,
    Overloaded,
    RemoteDisconnected,
    TunnelFailed,
}

type Key = (AgentId, u64);

#[derive(Default)]
pub(crate) struct WaitingRoom {
    waiters: DashMap<Key, oneshot::Sender<Unlock>>,
}

impl WaitingRoom {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, recipient: AgentId, seq: u64) -> oneshot::Receiver<Unlock> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert((recipient, seq), tx);
        rx
    }

    /// Resolve one request. Returns false when nobody was waiting.
    pub(crate) fn complete(&self, recipient: AgentId, seq: u64, unlock: Unlock) -> bool {
        match self.waiters.remove(&(recipient, seq)) {
            Some((_, tx)) => tx.send(unlock).is_ok(),
            None => false,
        }
    }

    pub(crate) fn cancel(&self, recipient: AgentId, seq: u64) {
        self.waiters.remove(&(recipient, seq));
    }

    /// Resolve every request addressed to `recipient`.
    pub(crate) fn fail_recipient(&self, recipient: AgentId, unlock: Unlock) -> usize {
        let keys: Vec<Key> = self
            .waiters
            .iter()
            .filter(|e| e.key().0 == recipient)
            .map(|e| *e.key())
            .collect();
        self.resolve(keys, unlock)
    }

    /// Resolve every pending request.
    pub(crate) fn fail_all(&self, unlock: Unlock) -> usize {
        let keys: Vec<Key> = self.waiters.iter().map(|e| *e.key()).collect();
        self.resolve(keys, unlock)
    }

    fn resolve(&self, keys: Vec<Key>, unlock: Unlock) -> usize {
        let mut n = 0;
        for key in keys {
            if let Some((_, tx)) = self.waiters.remove(&key) {
                let _ = tx.send(unlock.clone());
                n += 1;
            }
        }
        n
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}
