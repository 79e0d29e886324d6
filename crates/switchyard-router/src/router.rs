//! Router core: listener, registration and shared router state.
//!
//! A [`Router`] binds a TCP listener and spawns one task per accepted
//! connection (see [`crate::connection`]) plus the heartbeat/eviction
//! sweeper. All state shared between those tasks lives here and is
//! injected at construction; there are no process-wide singletons.

use crate::allocator::AgentIdAllocator;
use crate::config;
use crate::connection;
use crate::error::{RouterError, RouterResult};
use crate::registry::ClientRegistry;
use crate::session::{ClientSession, Link, SessionEvicted, SessionStatus};
use crate::sweeper;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use switchyard_types::{AgentId, MagicCookie, ReservedAgent, RouterConfig, RouterId};
use switchyard_wire::{encode, ErrorCode, Message};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Changes applied by a reserved-agent reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Reserved ids created or re-created with a new cookie.
    pub installed: usize,
    /// Reserved ids no longer configured.
    pub removed: usize,
}

/// A running router.
pub struct Router {
    config: RwLock<Arc<RouterConfig>>,
    config_path: Option<PathBuf>,
    registry: Arc<ClientRegistry>,
    allocator: AgentIdAllocator,
    router_id: RouterId,
    epoch: Instant,
    local_addr: SocketAddr,
    next_conn_id: AtomicU64,
    connections: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Router {
    /// Bind the listener and start serving.
    ///
    /// `config_path` is the file re-read on reload requests. Returns the
    /// router and the handle of its accept loop, which finishes after
    /// [`Router::shutdown`].
    pub async fn start(
        config: RouterConfig,
        config_path: Option<PathBuf>,
    ) -> RouterResult<(Arc<Self>, JoinHandle<()>)> {
        Self::start_with_registry(config, config_path, Arc::new(ClientRegistry::new())).await
    }

    /// Like [`Router::start`], with a caller-provided registry.
    pub async fn start_with_registry(
        config: RouterConfig,
        config_path: Option<PathBuf>,
        registry: Arc<ClientRegistry>,
    ) -> RouterResult<(Arc<Self>, JoinHandle<()>)> {
        config.validate()?;

        let addr = config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RouterError::BindFailed(addr, e))?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);

        let router = Arc::new(Self {
            connections: Arc::new(Semaphore::new(config.max_connections)),
            config: RwLock::new(Arc::new(config.clone())),
            config_path,
            registry,
            allocator: AgentIdAllocator::new(),
            router_id: RouterId::generate(),
            epoch: Instant::now(),
            local_addr,
            next_conn_id: AtomicU64::new(1),
            shutdown,
        });

        let report = router.apply_reserved(&config.reserved);
        info!(
            addr = %local_addr,
            router_id = %router.router_id,
            heartbeat_timeout_ms = config.heartbeat_timeout_ms,
            eviction_timeout_ms = config.client_eviction_timeout_ms,
            reserved = report.installed,
            "Router listening"
        );

        let sweeper = sweeper::spawn_sweeper(Arc::clone(&router));
        let accept_router = Arc::clone(&router);
        let handle = tokio::spawn(async move {
            Arc::clone(&accept_router).accept_loop(listener).await;
            let _ = sweeper.await;
            accept_router.close_all();
            info!("Router stopped");
        });

        Ok((router, handle))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let permit = match Arc::clone(&self.connections).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(peer = %addr, "Connection limit reached, refusing connection");
                            drop(stream);
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }
                    debug!(peer = %addr, "Accepted connection");
                    let router = Arc::clone(&self);
                    tokio::spawn(async move {
                        connection::serve(router, stream, addr).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    // -- accessors ----------------------------------------------------------

    /// Actual bound address (useful when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn router_id(&self) -> RouterId {
        self.router_id
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<RouterConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Milliseconds on the router clock.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Connections currently holding a slot.
    pub fn active_connections(&self) -> usize {
        self.config().max_connections - self.connections.available_permits()
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop accepting, stop the sweeper and close every connection.
    pub fn shutdown(&self) {
        info!("Router shutting down");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn close_all(&self) {
        for session in self.registry.snapshot() {
            session.evict();
        }
    }

    // -- registration -------------------------------------------------------

    /// Bind `link` to a new or existing identity.
    ///
    /// On rejection the registry is left untouched and the returned code is
    /// sent to the client.
    pub(crate) fn register(
        &self,
        requested: AgentId,
        cookie: MagicCookie,
        router_id: RouterId,
        link: Link,
    ) -> Result<Arc<ClientSession>, ErrorCode> {
        let config = self.config();
        let now = self.now_ms();

        if requested.is_invalid() {
            let id = self.allocator.allocate();
            let session = Arc::new(ClientSession::connected(
                id,
                MagicCookie::random(),
                link,
                now,
                config.outbound_queue_capacity,
            ));
            self.registry.put(Arc::clone(&session));
            return Ok(session);
        }

        if !requested.is_reserved() && router_id != self.router_id {
            debug!(
                agent_id = %requested,
                presented = %router_id,
                "Re-registration for another router instance"
            );
            return Err(ErrorCode::InvalidRouterId);
        }

        let session = self
            .registry
            .get(requested)
            .ok_or(ErrorCode::InvalidAgentId)?;
        if !session.cookie_matches(&cookie) {
            warn!(agent_id = %requested, "Re-registration with wrong cookie");
            return Err(ErrorCode::WrongMagicCookie);
        }
        match session.attach(link, now) {
            Ok(Some(previous)) => {
                debug!(
                    agent_id = %requested,
                    conn_id = previous.conn_id(),
                    "Closing superseded connection"
                );
                previous.close();
            }
            Ok(None) => {}
            Err(SessionEvicted) => return Err(ErrorCode::InvalidAgentId),
        }
        Ok(session)
    }

    // -- notifications ------------------------------------------------------

    /// Tell every other connected client that `id` has disconnected.
    pub fn broadcast_disconnection(&self, id: AgentId) {
        let msg = Message::error(id, 0, ErrorCode::DisconnectionBroadcast, "");
        let frame = match encode(&msg, self.config().max_payload_size) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Failed to encode disconnection broadcast");
                return;
            }
        };
        let mut notified = 0usize;
        for session in self.registry.snapshot() {
            if session.id() != id && session.notify(frame.clone()) {
                notified += 1;
            }
        }
        debug!(agent_id = %id, notified, "Broadcast disconnection");
    }

    // -- reserved agents ----------------------------------------------------

    /// Handle a reload request, authorized by the admin cookie.
    pub(crate) fn handle_reload(&self, presented: &MagicCookie, peer: SocketAddr) {
        let authorized = self
            .config()
            .admin_cookie
            .map(|c| c.matches(presented))
            .unwrap_or(false);
        if !authorized {
            warn!(peer = %peer, "Ignoring reload request with invalid admin cookie");
            return;
        }
        match self.reload_configuration() {
            Ok(report) => info!(
                peer = %peer,
                installed = report.installed,
                removed = report.removed,
                "Configuration reloaded"
            ),
            Err(e) => warn!(peer = %peer, error = %e, "Configuration reload failed"),
        }
    }

    /// Re-read the configuration file and apply its reserved agents and
    /// admin cookie. Other settings need a restart.
    pub fn reload_configuration(&self) -> RouterResult<ReloadReport> {
        let path = self.config_path.as_ref().ok_or(RouterError::NoConfigFile)?;
        let fresh = config::try_load_config(path)?;

        let report = self.apply_reserved(&fresh.reserved);

        let mut guard = self.config.write().unwrap_or_else(|e| e.into_inner());
        let mut next = RouterConfig::clone(&guard);
        next.reserved = fresh.reserved.clone();
        next.admin_cookie = fresh.admin_cookie;
        if fresh != next {
            warn!("Only reserved agents and admin_cookie are applied on reload; restart for other changes");
        }
        *guard = Arc::new(next);
        Ok(report)
    }

    /// Make the reserved sessions in the registry match `reserved`.
    pub fn apply_reserved(&self, reserved: &[ReservedAgent]) -> ReloadReport {
        let mut report = ReloadReport::default();
        let wanted: HashMap<AgentId, MagicCookie> =
            reserved.iter().map(|r| (r.id, r.cookie)).collect();
        let capacity = self.config().outbound_queue_capacity;

        for session in self.registry.snapshot() {
            if session.is_reserved() && !wanted.contains_key(&session.id()) {
                self.retire(&session);
                report.removed += 1;
            }
        }

        for (&id, cookie) in &wanted {
            if let Some(existing) = self.registry.get(id) {
                if existing.cookie_matches(cookie) {
                    continue;
                }
                self.retire(&existing);
            }
            let session = Arc::new(ClientSession::reserved(id, *cookie, self.now_ms(), capacity));
            self.registry.put(session);
            debug!(agent_id = %id, "Installed reserved agent");
            report.installed += 1;
        }
        report
    }

    fn retire(&self, session: &Arc<ClientSession>) {
        let was_connected = session.status() == SessionStatus::Connected;
        self.registry
            .remove_if(session.id(), |s| std::ptr::eq(s, Arc::as_ptr(session)));
        session.evict();
        if was_connected {
            self.broadcast_disconnection(session.id());
        }
        debug!(agent_id = %session.id(), "Retired reserved agent");
    }
}
