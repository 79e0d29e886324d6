//! Client registry: the concurrent map from agent id to session.
//!
//! At most one [`ClientSession`] exists per [`AgentId`]. Mutations are atomic
//! per key; the sweeper works from [`ClientRegistry::snapshot`] so no map
//! lock is held while sessions are inspected.

use crate::session::{ClientSession, SessionStatus};
use dashmap::DashMap;
use std::sync::Arc;
use switchyard_types::AgentId;

/// Thread-safe registry of every known session.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sessions: DashMap<AgentId, Arc<ClientSession>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the session for its id. Returns the replaced one.
    pub fn put(&self, session: Arc<ClientSession>) -> Option<Arc<ClientSession>> {
        self.sessions.insert(session.id(), session)
    }

    pub fn get(&self, id: AgentId) -> Option<Arc<ClientSession>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: AgentId) -> Option<Arc<ClientSession>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    /// Remove the entry for `id` only if `predicate` holds, evaluated while
    /// the entry is locked.
    pub fn remove_if<F>(&self, id: AgentId, predicate: F) -> Option<Arc<ClientSession>>
    where
        F: FnOnce(&ClientSession) -> bool,
    {
        self.sessions
            .remove_if(&id, |_, session| predicate(session))
            .map(|(_, session)| session)
    }

    /// Point-in-time copy of all sessions.
    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions with a live connection.
    pub fn connected_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().status() == SessionStatus::Connected)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_types::MagicCookie;

    fn reserved(id: u64) -> Arc<ClientSession> {
        Arc::new(ClientSession::reserved(AgentId(id), MagicCookie::random(), 0, 8))
    }

    #[test]
    fn test_put_get_remove() {
        let registry = ClientRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.put(reserved(1)).is_none());
        assert_eq!(registry.get(AgentId(1)).unwrap().id(), AgentId(1));
        assert!(registry.get(AgentId(2)).is_none());
        assert!(registry.remove(AgentId(1)).is_some());
        assert!(registry.remove(AgentId(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_put_replaces() {
        let registry = ClientRegistry::new();
        let first = reserved(3);
        registry.put(Arc::clone(&first));
        let replaced = registry.put(reserved(3)).unwrap();
        assert!(Arc::ptr_eq(&first, &replaced));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_if_respects_predicate() {
        let registry = ClientRegistry::new();
        registry.put(reserved(4));
        assert!(registry.remove_if(AgentId(4), |_| false).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_if(AgentId(4), |s| s.is_reserved()).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let registry = ClientRegistry::new();
        for id in 1..=5 {
            registry.put(reserved(id));
        }
        let snap = registry.snapshot();
        registry.remove(AgentId(1));
        assert_eq!(snap.len(), 5);
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.connected_count(), 0);
    }

    #[test]
    fn test_concurrent_disjoint_operations() {
        let registry = Arc::new(ClientRegistry::new());
        let threads: Vec<_> = (0..8u64)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let base = 1 + t * 100;
                    for id in base..base + 100 {
                        registry.put(reserved(id));
                        assert!(registry.get(AgentId(id)).is_some());
                    }
                    // Remove the odd half of this thread's range.
                    for id in (base..base + 100).filter(|i| i % 2 == 1) {
                        assert!(registry.remove(AgentId(id)).is_some());
                    }
                })
            })
            .collect();

        let reader = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    for session in registry.snapshot() {
                        assert!(session.id().is_reserved());
                    }
                }
            })
        };

        for t in threads {
            t.join().unwrap();
        }
        reader.join().unwrap();

        assert_eq!(registry.len(), 400);
        for id in 1..=800u64 {
            assert_eq!(registry.get(AgentId(id)).is_some(), id % 2 == 0, "id {id}");
        }
    }
}
