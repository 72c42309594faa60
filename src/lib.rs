// lib.rs - HAMAS Transport Layer
//
// Message transport for household multi-agent systems: one connector
// abstraction over in-process, Unix socket, TCP and radio media, and a
// Router that maps agent identities to reachable connectors.

#![doc = include_str!("../README.md")]

pub mod address;
pub mod codec;
pub mod config;
pub mod connector;
pub mod envelope;
pub mod error;
pub mod observability;
pub mod retry;
pub mod router;
pub mod routing;

// Re-export commonly used types
pub use address::{AgentAddress, AgentId, ConnectorKind, NodeId, Port};

pub use connector::{
    Connector, ConnectorState, ConnectorStats, LocalConnector, PlatformConnector, UnixConnector,
    ZigBeeConnector,
};

pub use envelope::Envelope;

pub use error::{ConnectionError, SendError, TransportError};

pub use router::{AgentHandle, DeliveryReport, RegistryEvent, Router, RouterConfig, RouterStats};

pub use config::TransportConfig;

pub use observability::{
    init_metrics, init_tracing, EventSink, MetricsConfig, MetricsHandle, SharedSink,
    TracingConfig, TracingFormat, TracingSink, TransportEvent,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::address::{AgentAddress, AgentId, ConnectorKind, NodeId, Port};
    pub use crate::connector::platform::PlatformConfig;
    pub use crate::connector::unix::UnixConfig;
    pub use crate::connector::zigbee::{RadioLink, SimulatedMedium, ZigBeeConfig};
    pub use crate::connector::{
        Connector, LocalConnector, PlatformConnector, UnixConnector, ZigBeeConnector,
    };
    pub use crate::envelope::Envelope;
    pub use crate::error::{SendError, TransportError};
    pub use crate::observability::{EventSink, SharedSink, TracingSink, TransportEvent};
    pub use crate::retry::RetryPolicy;
    pub use crate::router::{AgentHandle, DeliveryReport, RegistryEvent, Router, RouterConfig};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
