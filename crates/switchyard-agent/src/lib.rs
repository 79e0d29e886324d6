//! Client library for Switchyard agents.
//!
//! An [`Agent`] registers with a router over TCP, keeps the tunnel alive with
//! heartbeats, and exchanges opaque payloads with other agents:
//!
//! - [`Agent::send`]: fire-and-forget delivery
//! - [`Agent::request`]: send and wait for the recipient's reply
//! - [`MessageHandler`]: inbound data and error notifications
//!
//! If the tunnel fails, the agent reconnects with its stored identity
//! according to [`switchyard_types::ReconnectPolicy`].

mod agent;
pub mod backoff;
pub mod error;
pub mod handler;
mod tunnel;
mod waiting_room;

pub use agent::{Agent, ConnectionState};
pub use error::{AgentError, AgentResult};
pub use handler::{ErrorNotification, MessageHandler};
