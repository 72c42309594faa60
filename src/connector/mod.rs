// connector/mod.rs - Connector Framework
//
//! Connectors own one communication medium each.
//!
//! A connector turns an [`Envelope`] plus a medium-specific [`Port`] into
//! bytes on its medium, and turns inbound bytes back into envelopes on its
//! receive stream. The Router decides which connector to use; connectors
//! never look at each other's state.
//!
//! Connectors that learn about other platforms (socket directory, handshakes,
//! radio announcements) answer [`Connector::discover`], which the Router
//! consults for destinations without a registered route.
//!
//! | Connector | Medium | Port |
//! |-----------|--------|------|
//! | [`LocalConnector`] | in-process mailbox | `local:<agent>` |
//! | [`UnixConnector`] | Unix domain socket | `unix:<path>` |
//! | [`PlatformConnector`] | TCP | `platform:<ip:port>` |
//! | [`ZigBeeConnector`] | 802.15.4 radio | `zigbee:<hex node id>` |

pub mod local;
pub mod platform;
pub mod unix;
pub mod zigbee;

pub use local::LocalConnector;
pub use platform::{PlatformConnector, PlatformFrame};
pub use unix::UnixConnector;
pub use zigbee::ZigBeeConnector;

use crate::address::{AgentId, ConnectorKind, Port};
use crate::envelope::Envelope;
use crate::error::{SendError, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lazy stream of inbound envelopes, ends when the connector closes
pub type InboundStream = BoxStream<'static, Envelope>;

/// Local agent mailboxes, shared between the Router and the LocalConnector
pub type Mailboxes = Arc<DashMap<AgentId, mpsc::UnboundedSender<Envelope>>>;

/// Connector lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Open,
    Closed,
}

/// Connector statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectorStats {
    /// Envelopes accepted by the medium
    pub messages_sent: u64,

    /// Envelopes decoded from the medium
    pub messages_received: u64,

    /// Failed sends, transient or fatal
    pub send_failures: u64,

    /// Malformed inbound frames dropped
    pub framing_errors: u64,

    /// Payload bytes sent
    pub bytes_sent: u64,

    /// Payload bytes received
    pub bytes_received: u64,

    /// Open connections or links
    pub active_connections: usize,
}

/// Capability interface every medium implements
#[async_trait]
pub trait Connector: Send + Sync {
    /// Medium this connector drives
    fn kind(&self) -> ConnectorKind;

    /// Port under which peers reach this connector
    fn local_port(&self) -> Port;

    fn state(&self) -> ConnectorState;

    /// Hand one envelope to the medium.
    ///
    /// `Ok` means the medium accepted it, not that the peer agent read it.
    async fn send(&self, port: &Port, envelope: &Envelope) -> Result<(), SendError>;

    /// Take the inbound stream. Only the first call succeeds.
    fn receive(&self) -> Result<InboundStream, TransportError>;

    /// Release the medium. Idempotent.
    async fn close(&self);

    fn stats(&self) -> ConnectorStats;

    /// Port of another platform this connector has discovered by name
    async fn discover(&self, _platform: &str) -> Option<Port> {
        None
    }

    /// Announce this platform and refresh the discovered peers. Called
    /// periodically by the Router.
    async fn refresh(&self) {}
}

/// Lock-free counters behind [`ConnectorStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    send_failures: AtomicU64,
    framing_errors: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, active_connections: usize) -> ConnectorStats {
        ConnectorStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            active_connections,
        }
    }
}

/// Open/closed flag with a single winning transition to closed
#[derive(Debug)]
pub(crate) struct Lifecycle {
    closed: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> ConnectorState {
        if self.closed.load(Ordering::Acquire) {
            ConnectorState::Closed
        } else {
            ConnectorState::Open
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` for the caller that actually closed it
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Inbound stream handed out at most once
pub(crate) struct ReceiveSlot {
    stream: parking_lot::Mutex<Option<InboundStream>>,
}

impl ReceiveSlot {
    pub(crate) fn new(stream: InboundStream) -> Self {
        Self {
            stream: parking_lot::Mutex::new(Some(stream)),
        }
    }

    pub(crate) fn take(&self) -> Result<InboundStream, TransportError> {
        self.stream.lock().take().ok_or(TransportError::AlreadyTaken)
    }
}

/// Counts a live connection for as long as it is held, even across aborts
pub(crate) struct ActiveCount<'a>(&'a AtomicUsize);

impl<'a> ActiveCount<'a> {
    pub(crate) fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveCount<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Reject ports that belong to another connector
pub(crate) fn wrong_port(expected: ConnectorKind, port: &Port) -> SendError {
    SendError::fatal(format!("{expected} connector cannot reach {port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_lifecycle_single_close() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ConnectorState::Open);
        assert!(lifecycle.close());
        assert!(!lifecycle.close());
        assert_eq!(lifecycle.state(), ConnectorState::Closed);
    }

    #[tokio::test]
    async fn test_receive_slot_taken_once() {
        let slot = ReceiveSlot::new(futures::stream::empty().boxed());
        let mut stream = slot.take().unwrap();
        assert!(stream.next().await.is_none());
        assert!(matches!(slot.take(), Err(TransportError::AlreadyTaken)));
    }

    #[test]
    fn test_stats_snapshot() {
        let counters = StatsCounters::default();
        counters.sent(10);
        counters.sent(5);
        counters.received(3);
        counters.send_failed();
        let stats = counters.snapshot(2);
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 15);
        assert_eq!(stats.bytes_received, 3);
        assert_eq!(stats.send_failures, 1);
        assert_eq!(stats.active_connections, 2);
    }
}
