//! Router and agent configuration.
//!
//! Both structures deserialize from TOML with every field optional; missing
//! fields take the values from `Default`. Durations are carried as
//! milliseconds and exposed as [`Duration`] through accessor methods.

use crate::error::ConfigError;
use crate::id::{AgentId, MagicCookie, RouterId};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default router port.
pub const DEFAULT_PORT: u16 = 33647;

/// Default heartbeat timeout (9 s).
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 9_000;

/// Default largest data payload accepted on the wire (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Default per-session outbound queue capacity, in frames.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// A reserved agent identity installed from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedAgent {
    /// Must lie in `1..MIN_DYNAMIC_AGENT_ID`.
    pub id: AgentId,
    /// Cookie clients must present to claim the id.
    pub cookie: MagicCookie,
}

/// Router configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Address to bind the listener on.
    pub bind_addr: IpAddr,
    /// TCP port; `0` picks an ephemeral port.
    pub port: u16,
    /// Idle time after which a connected client is considered gone.
    pub heartbeat_timeout_ms: u64,
    /// Grace period, after disconnection, before an agent id is discarded.
    pub client_eviction_timeout_ms: u64,
    /// Largest data payload, in bytes.
    pub max_payload_size: u32,
    /// Concurrent TCP connections accepted before new ones are refused.
    pub max_connections: usize,
    /// Tokio worker threads used by the `serve` command.
    pub worker_threads: usize,
    /// Frames buffered per client before senders get an overload error.
    pub outbound_queue_capacity: usize,
    /// Cookie authorizing configuration reload requests.
    pub admin_cookie: Option<MagicCookie>,
    /// Reserved agent identities.
    pub reserved: Vec<ReservedAgent>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            client_eviction_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS * 4,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_connections: 4096,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            outbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            admin_cookie: None,
            reserved: Vec::new(),
        }
    }
}

impl RouterConfig {
    /// Parse a TOML document.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    #[must_use]
    pub fn with_bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr.ip();
        self.port = addr.port();
        self
    }

    #[must_use]
    pub const fn with_heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_eviction_timeout_ms(mut self, ms: u64) -> Self {
        self.client_eviction_timeout_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    #[must_use]
    pub fn with_admin_cookie(mut self, cookie: MagicCookie) -> Self {
        self.admin_cookie = Some(cookie);
        self
    }

    #[must_use]
    pub fn with_reserved(mut self, id: AgentId, cookie: MagicCookie) -> Self {
        self.reserved.push(ReservedAgent { id, cookie });
        self
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_millis(self.client_eviction_timeout_ms)
    }

    /// Period of the heartbeat/eviction sweep: a third of the heartbeat
    /// timeout, so a silent client is noticed at most `4/3 * H` after its
    /// last message.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis((self.heartbeat_timeout_ms / 3).max(1))
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.heartbeat_timeout_ms > u64::from(u32::MAX) {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_timeout_ms must fit in 32 bits, got {}",
                self.heartbeat_timeout_ms
            )));
        }
        if self.client_eviction_timeout_ms < self.heartbeat_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "client_eviction_timeout_ms ({}) must not be shorter than heartbeat_timeout_ms ({})",
                self.client_eviction_timeout_ms, self.heartbeat_timeout_ms
            )));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_capacity must be greater than zero".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than zero".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid(
                "worker_threads must be greater than zero".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for r in &self.reserved {
            if !r.id.is_reserved() {
                return Err(ConfigError::Invalid(format!(
                    "reserved agent id {} is outside the reserved range",
                    r.id
                )));
            }
            if r.cookie.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "reserved agent {} has an empty cookie",
                    r.id
                )));
            }
            if !seen.insert(r.id) {
                return Err(ConfigError::Invalid(format!(
                    "reserved agent id {} is declared twice",
                    r.id
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Identity obtained from a router: what a client presents to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub agent_id: AgentId,
    pub cookie: MagicCookie,
    /// Router that issued the id; unknown for reserved identities.
    #[serde(default = "unknown_router")]
    pub router_id: RouterId,
}

fn unknown_router() -> RouterId {
    RouterId::UNKNOWN
}

/// Reconnection behaviour after an unexpected tunnel failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between retries.
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 = none). The delay is `delay * (1 + r * jitter)`
    /// with `r` in `[0, 1)`, clamped to `max_delay_ms`.
    pub jitter: f64,
    /// Give up after this many consecutive failed attempts; `0` retries
    /// forever.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter: 0.2,
            max_attempts: 0,
        }
    }
}

/// Client-side configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `host:port` of the router.
    pub router_addr: String,
    pub connect_timeout_ms: u64,
    /// Bounded wait for the registration reply.
    pub registration_timeout_ms: u64,
    /// Heartbeat period. Never longer than a third of the heartbeat timeout
    /// the router advertises.
    pub heartbeat_interval_ms: u64,
    /// Frames buffered locally before `send` waits.
    pub outbound_queue_capacity: usize,
    pub max_payload_size: u32,
    pub reconnect: ReconnectPolicy,
    /// Previously obtained identity to resume.
    pub identity: Option<Identity>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            router_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            connect_timeout_ms: 5_000,
            registration_timeout_ms: 10_000,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS / 3,
            outbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            reconnect: ReconnectPolicy::default(),
            identity: None,
        }
    }
}

impl AgentConfig {
    /// Config pointing at `router_addr` with defaults elsewhere.
    pub fn new(router_addr: impl Into<String>) -> Self {
        Self {
            router_addr: router_addr.into(),
            ..Self::default()
        }
    }

    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    #[must_use]
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    #[must_use]
    pub const fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    #[must_use]
    pub const fn with_registration_timeout_ms(mut self, ms: u64) -> Self {
        self.registration_timeout_ms = ms;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    /// Effective heartbeat period against a router advertising
    /// `router_timeout_ms`.
    pub fn heartbeat_interval(&self, router_timeout_ms: u32) -> Duration {
        let cap = (u64::from(router_timeout_ms) / 3).max(1);
        Duration::from_millis(self.heartbeat_interval_ms.clamp(1, cap))
    }
}
