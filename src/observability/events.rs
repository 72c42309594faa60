// observability/events.rs - Transport Event Sink

//! Structured transport events and the sink interface they flow through.
//!
//! Connectors and the Router report everything they do as a
//! [`TransportEvent`]. What happens to the events is up to the embedding
//! application; [`TracingSink`] logs them and is the default.

use crate::address::{AgentId, ConnectorKind, NodeId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Connection state of a stream-oriented link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

/// Everything the transport layer reports
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectorOpened {
        kind: ConnectorKind,
        address: String,
    },
    ConnectorClosed {
        kind: ConnectorKind,
    },
    LinkStateChanged {
        kind: ConnectorKind,
        peer: String,
        from: LinkState,
        to: LinkState,
    },
    MessageSent {
        kind: ConnectorKind,
        source: AgentId,
        destination: AgentId,
        sequence: u64,
        bytes: usize,
        attempts: u32,
    },
    MessageReceived {
        kind: ConnectorKind,
        source: AgentId,
        destination: AgentId,
        sequence: u64,
        bytes: usize,
    },
    SendFailed {
        kind: ConnectorKind,
        destination: AgentId,
        transient: bool,
        reason: String,
    },
    Retrying {
        kind: ConnectorKind,
        destination: AgentId,
        attempt: u32,
        delay: Duration,
    },
    /// Inbound envelope for an agent with no local mailbox
    RoutingError {
        destination: AgentId,
        reason: String,
    },
    /// Malformed inbound data, dropped
    FramingError {
        kind: ConnectorKind,
        peer: String,
        detail: String,
    },
    /// Incomplete radio message dropped; a transient loss
    ReassemblyExpired {
        source: NodeId,
        message_id: u16,
        received: usize,
        expected: usize,
    },
}

/// Receiver of transport events.
///
/// Called inline on hot paths, so implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TransportEvent);
}

/// Shared handle to a sink
pub type SharedSink = Arc<dyn EventSink>;

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &TransportEvent) {
        match event {
            TransportEvent::ConnectorOpened { kind, address } => {
                tracing::info!(connector = %kind, %address, "Connector opened");
            }
            TransportEvent::ConnectorClosed { kind } => {
                tracing::info!(connector = %kind, "Connector closed");
            }
            TransportEvent::LinkStateChanged { kind, peer, from, to } => {
                tracing::debug!(connector = %kind, %peer, ?from, ?to, "Link state changed");
            }
            TransportEvent::MessageSent {
                kind,
                source,
                destination,
                sequence,
                bytes,
                attempts,
            } => {
                tracing::debug!(
                    connector = %kind,
                    %source,
                    %destination,
                    sequence,
                    bytes,
                    attempts,
                    "Message sent"
                );
            }
            TransportEvent::MessageReceived {
                kind,
                source,
                destination,
                sequence,
                bytes,
            } => {
                tracing::debug!(
                    connector = %kind,
                    %source,
                    %destination,
                    sequence,
                    bytes,
                    "Message received"
                );
            }
            TransportEvent::SendFailed {
                kind,
                destination,
                transient,
                reason,
            } => {
                tracing::warn!(connector = %kind, %destination, transient, %reason, "Send failed");
            }
            TransportEvent::Retrying {
                kind,
                destination,
                attempt,
                delay,
            } => {
                tracing::debug!(connector = %kind, %destination, attempt, ?delay, "Retrying send");
            }
            TransportEvent::RoutingError { destination, reason } => {
                tracing::warn!(%destination, %reason, "Routing error, envelope dropped");
            }
            TransportEvent::FramingError { kind, peer, detail } => {
                tracing::warn!(connector = %kind, %peer, %detail, "Framing error, frame dropped");
            }
            TransportEvent::ReassemblyExpired {
                source,
                message_id,
                received,
                expected,
            } => {
                tracing::warn!(
                    %source,
                    message_id,
                    received,
                    expected,
                    "Incomplete radio message dropped"
                );
            }
        }
    }
}

/// Forwards each event to several sinks
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &TransportEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Keeps events in memory; handy for diagnostics and tests
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TransportEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    /// Events matching a predicate
    pub fn matching<F>(&self, predicate: F) -> Vec<TransportEvent>
    where
        F: Fn(&TransportEvent) -> bool,
    {
        self.events.lock().iter().filter(|e| predicate(e)).cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &TransportEvent) {
        self.events.lock().push(event.clone());
    }
}
