// error.rs - Transport Error Taxonomy

use crate::address::{AddressError, AgentId, ConnectorKind};
use crate::codec::FramingError;
use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single connector send
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Retryable: busy medium, collision, full buffer
    #[error("Transient send failure: {0}")]
    Transient(String),

    /// Not retryable: peer closed, handshake rejected, unknown destination
    #[error("Fatal send failure: {0}")]
    Fatal(String),
}

impl SendError {
    pub fn transient(reason: impl Into<String>) -> Self {
        SendError::Transient(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        SendError::Fatal(reason.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }

    /// Classify an I/O error from a socket write
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::TimedOut => {
                SendError::Transient(err.to_string())
            }
            _ => SendError::Fatal(err.to_string()),
        }
    }
}

/// Failure to open a connector's medium
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Medium unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors surfaced by the transport layer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("No reachable port for agent {0}")]
    Unreachable(AgentId),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Fatal failure: {0}")]
    Fatal(String),

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Connector {0} is not attached")]
    NoConnector(ConnectorKind),

    #[error("Receive stream already taken")]
    AlreadyTaken,

    #[error("Agent {0} is already attached")]
    DuplicateAgent(AgentId),
}

impl From<SendError> for TransportError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Transient(reason) => TransportError::Transient(reason),
            SendError::Fatal(reason) => TransportError::Fatal(reason),
        }
    }
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
