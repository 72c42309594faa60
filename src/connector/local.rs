// connector/local.rs - In-Process Connector
//
//! Delivery between agents of the same Router.
//!
//! Envelopes go straight into the destination's mailbox without
//! serialization. An unbounded mailbox sender never blocks, so delivery is
//! in order and exactly once for as long as the mailbox exists.

use super::{
    wrong_port, Connector, ConnectorState, ConnectorStats, InboundStream, Lifecycle, Mailboxes,
    ReceiveSlot, StatsCounters,
};
use crate::address::{AgentId, ConnectorKind, Port};
use crate::envelope::Envelope;
use crate::error::{SendError, TransportError};
use crate::observability::{SharedSink, TransportEvent};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// In-process connector over the shared mailbox map
pub struct LocalConnector {
    mailboxes: Mailboxes,
    lifecycle: Lifecycle,
    stats: StatsCounters,
    events: SharedSink,
    /// Dropped on close, which ends the (always empty) receive stream
    close_signal: Mutex<Option<mpsc::Sender<Envelope>>>,
    inbound: ReceiveSlot,
}

impl LocalConnector {
    pub fn open(mailboxes: Mailboxes, events: SharedSink) -> Self {
        let (close_signal, rx) = mpsc::channel(1);
        events.emit(&TransportEvent::ConnectorOpened {
            kind: ConnectorKind::Local,
            address: "in-process".into(),
        });
        Self {
            mailboxes,
            lifecycle: Lifecycle::new(),
            stats: StatsCounters::default(),
            events,
            close_signal: Mutex::new(Some(close_signal)),
            inbound: ReceiveSlot::new(ReceiverStream::new(rx).boxed()),
        }
    }

    /// Whether an agent currently has a mailbox here
    pub fn has_mailbox(&self, id: &AgentId) -> bool {
        self.mailboxes.contains_key(id)
    }

    fn deliver(&self, id: &AgentId, envelope: &Envelope) -> Result<(), SendError> {
        let Some(mailbox) = self.mailboxes.get(id) else {
            return Err(SendError::fatal(format!("no mailbox for agent {id}")));
        };
        mailbox
            .send(envelope.clone())
            .map_err(|_| SendError::fatal(format!("mailbox of agent {id} is closed")))
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Local
    }

    /// The Local namespace is per agent; this is a placeholder identity
    fn local_port(&self) -> Port {
        Port::Local(AgentId::trusted("local"))
    }

    fn state(&self) -> ConnectorState {
        self.lifecycle.state()
    }

    async fn send(&self, port: &Port, envelope: &Envelope) -> Result<(), SendError> {
        if self.lifecycle.is_closed() {
            return Err(SendError::fatal("local connector is closed"));
        }
        let Port::Local(id) = port else {
            return Err(wrong_port(ConnectorKind::Local, port));
        };

        match self.deliver(id, envelope) {
            Ok(()) => {
                self.stats.sent(envelope.payload().len());
                self.stats.received(envelope.payload().len());
                Ok(())
            }
            Err(err) => {
                self.stats.send_failed();
                Err(err)
            }
        }
    }

    fn receive(&self) -> Result<InboundStream, TransportError> {
        self.inbound.take()
    }

    async fn close(&self) {
        if !self.lifecycle.close() {
            return;
        }
        self.close_signal.lock().take();
        self.events.emit(&TransportEvent::ConnectorClosed {
            kind: ConnectorKind::Local,
        });
    }

    fn stats(&self) -> ConnectorStats {
        self.stats.snapshot(self.mailboxes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MemorySink;
    use dashmap::DashMap;
    use std::sync::Arc;

    fn connector() -> (LocalConnector, Mailboxes, Arc<MemorySink>) {
        let mailboxes: Mailboxes = Arc::new(DashMap::new());
        let sink = Arc::new(MemorySink::new());
        let connector = LocalConnector::open(mailboxes.clone(), sink.clone());
        (connector, mailboxes, sink)
    }

    #[tokio::test]
    async fn test_local_delivery_in_order_exactly_once() {
        let (connector, mailboxes, _) = connector();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bob: AgentId = "bob".parse().unwrap();
        mailboxes.insert(bob.clone(), tx);

        for seq in 0..50u64 {
            let env = Envelope::new("alice".parse().unwrap(), bob.clone(), seq.to_be_bytes().to_vec(), seq);
            connector.send(&Port::Local(bob.clone()), &env).await.unwrap();
        }

        for seq in 0..50u64 {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.sequence(), seq);
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(connector.stats().messages_sent, 50);
    }

    #[tokio::test]
    async fn test_unknown_mailbox_is_fatal() {
        let (connector, _, _) = connector();
        let env = Envelope::new("alice".parse().unwrap(), "ghost".parse().unwrap(), b"hi".to_vec(), 0);
        let err = connector
            .send(&Port::Local("ghost".parse().unwrap()), &env)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_dropped_mailbox_is_fatal() {
        let (connector, mailboxes, _) = connector();
        let (tx, rx) = mpsc::unbounded_channel();
        mailboxes.insert("bob".parse().unwrap(), tx);
        drop(rx);

        let env = Envelope::new("alice".parse().unwrap(), "bob".parse().unwrap(), b"hi".to_vec(), 0);
        let err = connector.send(&Port::Local("bob".parse().unwrap()), &env).await.unwrap_err();
        assert!(matches!(err, SendError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_wrong_port_kind_rejected() {
        let (connector, _, _) = connector();
        let env = Envelope::new("alice".parse().unwrap(), "bob".parse().unwrap(), vec![], 0);
        let port = Port::Platform("127.0.0.1:1".parse().unwrap());
        assert!(matches!(
            connector.send(&port, &env).await,
            Err(SendError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_stream_ends_on_close() {
        let (connector, _, sink) = connector();
        let mut stream = connector.receive().unwrap();
        assert!(connector.receive().is_err());

        connector.close().await;
        connector.close().await;
        assert!(stream.next().await.is_none());
        assert_eq!(connector.state(), ConnectorState::Closed);

        let closed = sink.matching(|e| matches!(e, TransportEvent::ConnectorClosed { .. }));
        assert_eq!(closed.len(), 1);
    }
}
