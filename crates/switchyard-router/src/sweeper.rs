//! Heartbeat and eviction sweeper.
//!
//! Two-stage liveness: a connected client silent for longer than the
//! heartbeat timeout `H` is disconnected and its session kept; a session that
//! stays disconnected for longer than the eviction timeout `E` is removed and
//! its id can never be used again. Reserved sessions are never removed.
//!
//! [`sweep`] holds the logic and takes the current time as an argument;
//! [`spawn_sweeper`] runs it every `H / 3`.

use crate::registry::ClientRegistry;
use crate::router::Router;
use std::sync::Arc;
use switchyard_types::{AgentId, RouterConfig};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions moved from connected to pending eviction.
    pub disconnected: Vec<AgentId>,
    /// Sessions removed from the registry.
    pub evicted: Vec<AgentId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.disconnected.is_empty() && self.evicted.is_empty()
    }
}

/// Run one sweep over `registry` at router time `now_ms`.
pub fn sweep(registry: &ClientRegistry, now_ms: u64, config: &RouterConfig) -> SweepReport {
    let mut report = SweepReport::default();

    for session in registry.snapshot() {
        let id = session.id();
        if session.disconnect_if_idle(now_ms, config.heartbeat_timeout_ms) {
            report.disconnected.push(id);
            continue;
        }
        // Re-checked under the map entry lock, so a client that re-attaches
        // concurrently either wins (and the predicate fails) or finds the
        // session evicted and is refused.
        let removed = registry.remove_if(id, |s| {
            std::ptr::eq(s, Arc::as_ptr(&session))
                && s.evict_if_expired(now_ms, config.client_eviction_timeout_ms)
        });
        if let Some(session) = removed {
            info!(
                agent_id = %id,
                session_age_secs = session.age().num_seconds(),
                "Agent evicted"
            );
            report.evicted.push(id);
        }
    }

    report
}

/// Spawn the periodic sweep for `router`. Stops on router shutdown.
pub fn spawn_sweeper(router: Arc<Router>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = router.config().sweep_interval();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = router.subscribe_shutdown();
        debug!(period_ms = period.as_millis() as u64, "Sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }

            let config = router.config();
            let report = sweep(router.registry(), router.now_ms(), &config);
            for id in &report.disconnected {
                info!(agent_id = %id, "Agent missed heartbeats, disconnecting");
                router.broadcast_disconnection(*id);
            }
        }
        debug!("Sweeper stopped");
    })
}
