//! Router error types.

use std::net::SocketAddr;
use switchyard_types::ConfigError;
use switchyard_wire::{ErrorCode, WireError};
use thiserror::Error;

/// Errors that stop the router or one of its connections.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, #[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No configuration file to reload")]
    NoConfigFile,

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer violated the protocol; the connection is dropped.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A registration attempt was refused.
    #[error("Registration rejected: {code}")]
    Rejected { code: ErrorCode },

    #[error("Timed out waiting for registration")]
    RegistrationTimeout,
}

pub type RouterResult<T> = Result<T, RouterError>;
