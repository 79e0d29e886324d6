//! Switchyard router.
//!
//! Accepts TCP connections from agents, assigns agent ids, and forwards
//! addressed frames between registered agents.
//!
//! ## Architecture
//!
//! - **Router**: listener, registration and shared state
//! - **ClientRegistry**: concurrent map of agent id to session
//! - **ClientSession**: per-identity state machine and outbound queue
//! - **AgentIdAllocator**: unique, never-recycled agent ids
//! - **sweeper**: heartbeat timeout and eviction

pub mod allocator;
pub mod config;
mod connection;
pub mod error;
pub mod registry;
pub mod router;
pub mod session;
pub mod sweeper;

pub use allocator::AgentIdAllocator;
pub use error::{RouterError, RouterResult};
pub use registry::ClientRegistry;
pub use router::{ReloadReport, Router};
pub use session::{ClientSession, Delivery, SessionState, SessionStatus};
pub use sweeper::{sweep, SweepReport};
