//! Core types for the Switchyard message relay.
//!
//! This crate defines the identifiers, configuration structures and shared
//! error types used by the wire codec, the router and the agent library.
//! It contains no networking code.

pub mod config;
pub mod error;
pub mod id;

pub use config::{AgentConfig, Identity, ReconnectPolicy, ReservedAgent, RouterConfig};
pub use error::ConfigError;
pub use id::{AgentId, MagicCookie, RouterId, MIN_DYNAMIC_AGENT_ID};
