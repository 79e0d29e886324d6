//! Dynamic agent id allocation.

use std::sync::atomic::{AtomicU64, Ordering};
use switchyard_types::{AgentId, MIN_DYNAMIC_AGENT_ID};

/// Hands out unique agent ids for the lifetime of a router.
///
/// Ids start at [`MIN_DYNAMIC_AGENT_ID`] and are never recycled, so an id
/// seen once can never name a different client later.
#[derive(Debug)]
pub struct AgentIdAllocator {
    next: AtomicU64,
}

impl AgentIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(MIN_DYNAMIC_AGENT_ID),
        }
    }

    pub fn allocate(&self) -> AgentId {
        AgentId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Ids handed out so far.
    pub fn allocated(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - MIN_DYNAMIC_AGENT_ID
    }
}

impl Default for AgentIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
