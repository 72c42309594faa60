// connector/zigbee/mod.rs - ZigBee Radio Connector
//
//! Low-bandwidth radio transport between embedded platforms.
//!
//! Envelopes are split into MTU-sized fragments (see [`fragment`]) and sent
//! one frame at a time over a [`RadioLink`]. Each fragment is retried with a
//! randomized slot backoff while the channel is contended. On the receiving
//! side fragments are reassembled per sender; messages that stay incomplete
//! past the reassembly timeout are dropped and reported, never delivered in
//! part.
//!
//! # Discovery
//!
//! [`ZigBeeConnector::announce`] broadcasts a `Join` frame carrying the node
//! name. Nodes hearing it record the name and answer with an `Announce`, so
//! both sides learn each other's short address.

pub mod fragment;
pub mod radio;

pub use fragment::{Accepted, Expired, FragmentHeader, FrameKind, Reassembler};
pub use radio::{RadioError, RadioLink, SimRadio, SimulatedMedium, DEFAULT_MTU};

use super::{
    wrong_port, Connector, ConnectorState, ConnectorStats, InboundStream, Lifecycle, ReceiveSlot,
    StatsCounters,
};
use crate::address::{ConnectorKind, NodeId, Port};
use crate::codec::FramingError;
use crate::envelope::Envelope;
use crate::error::{ConnectionError, SendError, TransportError};
use crate::observability::{SharedSink, TransportEvent};
use crate::retry::contention_backoff;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

/// ZigBee connector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZigBeeConfig {
    /// Name announced during discovery; must fit in one fragment
    pub node_name: String,

    /// Frame size limit; the radio's own MTU wins if smaller
    pub mtu: usize,

    /// Incomplete messages older than this are dropped, in milliseconds
    pub reassembly_timeout_ms: u64,

    /// How often incomplete messages are checked for expiry, in milliseconds
    pub expiry_check_interval_ms: u64,

    /// Incomplete messages buffered per sender before the oldest is dropped
    pub max_pending_per_source: usize,

    /// Transmissions per fragment before the send fails transiently
    pub max_fragment_attempts: u32,

    /// Contention backoff slot in milliseconds
    pub backoff_slot_ms: u64,

    /// Inbound envelopes buffered before the radio loop waits
    pub inbound_capacity: usize,
}

impl Default for ZigBeeConfig {
    fn default() -> Self {
        Self {
            node_name: "hamas".into(),
            mtu: DEFAULT_MTU,
            reassembly_timeout_ms: 5_000,
            expiry_check_interval_ms: 250,
            max_pending_per_source: 8,
            max_fragment_attempts: 5,
            backoff_slot_ms: 2,
            inbound_capacity: 256,
        }
    }
}

impl ZigBeeConfig {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_check_interval_ms.max(1))
    }

    pub fn backoff_slot(&self) -> Duration {
        Duration::from_millis(self.backoff_slot_ms)
    }
}

struct ZigBeeInner {
    config: ZigBeeConfig,
    radio: Arc<dyn RadioLink>,
    mtu: usize,
    lifecycle: Lifecycle,
    stats: StatsCounters,
    events: SharedSink,
    next_message_id: AtomicU16,
    peers: DashMap<String, NodeId>,
}

impl ZigBeeInner {
    /// Transmit one frame, backing off while the channel is contended
    async fn transmit(&self, dest: NodeId, frame: Bytes) -> Result<(), SendError> {
        let max_attempts = self.config.max_fragment_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            match self.radio.transmit(dest, frame.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_contention() => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(SendError::transient(format!(
                            "{err} on node {dest} after {attempt} attempts"
                        )));
                    }
                    let delay = contention_backoff(self.config.backoff_slot(), attempt);
                    tracing::trace!(%dest, attempt, ?delay, error = %err, "Radio contention");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(SendError::fatal(format!("{err} (node {dest})"))),
            }
        }
    }

    async fn send_envelope(&self, dest: NodeId, envelope: &Envelope) -> Result<(), SendError> {
        let body = envelope
            .to_bytes()
            .map_err(|e| SendError::fatal(e.to_string()))?;
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let frames = fragment::fragment(FrameKind::Data, message_id, &body, self.mtu)?;

        tracing::trace!(%dest, message_id, fragments = frames.len(), "Sending radio message");
        for frame in frames {
            self.transmit(dest, frame).await?;
        }
        Ok(())
    }

    async fn send_name(&self, kind: FrameKind, dest: NodeId) -> Result<(), SendError> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let frames = fragment::fragment(kind, message_id, self.config.node_name.as_bytes(), self.mtu)?;
        for frame in frames {
            self.transmit(dest, frame).await?;
        }
        Ok(())
    }

    fn framing_error(&self, source: NodeId, err: &FramingError) {
        self.stats.framing_error();
        self.events.emit(&TransportEvent::FramingError {
            kind: ConnectorKind::ZigBee,
            peer: source.to_string(),
            detail: err.to_string(),
        });
    }

    fn report_expired(&self, expired: Expired) {
        self.events.emit(&TransportEvent::ReassemblyExpired {
            source: expired.source,
            message_id: expired.message_id,
            received: expired.received,
            expected: expired.expected,
        });
    }

    fn learn_peer(&self, name: &[u8], node: NodeId) -> Option<String> {
        let name = std::str::from_utf8(name).ok()?.to_string();
        if name.is_empty() || name == self.config.node_name {
            return None;
        }
        if self.peers.insert(name.clone(), node) != Some(node) {
            tracing::info!(peer = %name, %node, "Discovered radio peer");
        }
        Some(name)
    }

    /// Handle one received radio frame. Returns `false` once nobody listens.
    async fn handle_frame(
        &self,
        reassembler: &mut Reassembler,
        source: NodeId,
        frame: Bytes,
        tx: &mpsc::Sender<Envelope>,
    ) -> bool {
        let (header, body) = match FragmentHeader::decode(&frame) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::trace!(%source, frame = %hex::encode(&frame), "Undecodable radio frame");
                self.framing_error(source, &err);
                return true;
            }
        };

        match header.kind {
            FrameKind::Data => {
                let accepted = reassembler.accept(source, header, body, Instant::now());
                for expired in reassembler.expire(Instant::now()) {
                    self.report_expired(expired);
                }

                match accepted {
                    Accepted::Complete(message) => match Envelope::from_bytes(&message) {
                        Ok(envelope) => {
                            self.stats.received(envelope.payload().len());
                            return tx.send(envelope).await.is_ok();
                        }
                        Err(err) => self.framing_error(source, &err),
                    },
                    Accepted::Inconsistent => {
                        let err = FramingError::Header(format!(
                            "fragment count changed within message {}",
                            header.message_id
                        ));
                        self.framing_error(source, &err);
                    }
                    Accepted::Incomplete | Accepted::Duplicate => {}
                }
            }
            FrameKind::Join => {
                if self.learn_peer(body, source).is_some() {
                    if let Err(err) = self.send_name(FrameKind::Announce, source).await {
                        tracing::debug!(%source, error = %err, "Announce reply failed");
                    }
                }
            }
            FrameKind::Announce => {
                self.learn_peer(body, source);
            }
        }
        true
    }
}

async fn receive_loop(inner: Arc<ZigBeeInner>, tx: mpsc::Sender<Envelope>) {
    let mut reassembler = Reassembler::new(
        inner.config.reassembly_timeout(),
        inner.config.max_pending_per_source,
    );
    let mut sweep = tokio::time::interval(inner.config.expiry_check_interval());

    loop {
        tokio::select! {
            received = inner.radio.recv() => match received {
                Some((source, frame)) => {
                    if !inner.handle_frame(&mut reassembler, source, frame, &tx).await {
                        break;
                    }
                }
                None => break,
            },
            _ = sweep.tick() => {
                for expired in reassembler.expire(Instant::now()) {
                    inner.report_expired(expired);
                }
            }
        }
    }

    tracing::debug!(node = %inner.radio.node_id(), "Radio receive loop stopped");
}

/// Connector over a radio modem
pub struct ZigBeeConnector {
    inner: Arc<ZigBeeInner>,
    inbound: ReceiveSlot,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl ZigBeeConnector {
    /// Start receiving on the given radio
    pub async fn open(
        config: ZigBeeConfig,
        radio: Arc<dyn RadioLink>,
        events: SharedSink,
    ) -> Result<Self, ConnectionError> {
        let mtu = config.mtu.min(radio.mtu());
        if mtu <= fragment::HEADER_LEN {
            return Err(ConnectionError::InvalidConfig(format!(
                "MTU {mtu} leaves no room for data"
            )));
        }
        if config.node_name.is_empty() || config.node_name.len() > mtu - fragment::HEADER_LEN {
            return Err(ConnectionError::InvalidConfig(format!(
                "node name '{}' must fit in one radio frame",
                config.node_name
            )));
        }

        let node = radio.node_id();
        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
        let inner = Arc::new(ZigBeeInner {
            config,
            radio,
            mtu,
            lifecycle: Lifecycle::new(),
            stats: StatsCounters::default(),
            events: events.clone(),
            next_message_id: AtomicU16::new(rand::random()),
            peers: DashMap::new(),
        });

        let receive_task = tokio::spawn(receive_loop(inner.clone(), tx));

        tracing::info!(name = %inner.config.node_name, %node, mtu, "ZigBee connector opened");
        events.emit(&TransportEvent::ConnectorOpened {
            kind: ConnectorKind::ZigBee,
            address: node.to_string(),
        });

        Ok(Self {
            inner,
            inbound: ReceiveSlot::new(ReceiverStream::new(rx).boxed()),
            receive_task: Mutex::new(Some(receive_task)),
        })
    }

    /// Short address of the local radio
    pub fn node_id(&self) -> NodeId {
        self.inner.radio.node_id()
    }

    /// Effective frame size
    pub fn mtu(&self) -> usize {
        self.inner.mtu
    }

    /// Broadcast our name so other nodes can find us
    pub async fn announce(&self) -> Result<(), SendError> {
        if self.inner.lifecycle.is_closed() {
            return Err(SendError::fatal("zigbee connector is closed"));
        }
        self.inner.send_name(FrameKind::Join, NodeId::BROADCAST).await
    }

    /// Names and addresses of nodes discovered so far
    pub fn peers(&self) -> HashMap<String, NodeId> {
        self.inner
            .peers
            .iter()
            .map(|p| (p.key().clone(), *p.value()))
            .collect()
    }

    /// Port of a discovered node
    pub fn resolve(&self, name: &str) -> Option<Port> {
        self.inner.peers.get(name).map(|node| Port::ZigBee(*node))
    }
}

#[async_trait]
impl Connector for ZigBeeConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::ZigBee
    }

    fn local_port(&self) -> Port {
        Port::ZigBee(self.inner.radio.node_id())
    }

    fn state(&self) -> ConnectorState {
        self.inner.lifecycle.state()
    }

    async fn send(&self, port: &Port, envelope: &Envelope) -> Result<(), SendError> {
        if self.inner.lifecycle.is_closed() {
            return Err(SendError::fatal("zigbee connector is closed"));
        }
        let Port::ZigBee(node) = port else {
            return Err(wrong_port(ConnectorKind::ZigBee, port));
        };
        if node.is_broadcast() {
            return Err(SendError::fatal("envelopes cannot be broadcast"));
        }

        let result = self.inner.send_envelope(*node, envelope).await;
        match &result {
            Ok(()) => self.inner.stats.sent(envelope.payload().len()),
            Err(err) => {
                self.inner.stats.send_failed();
                tracing::debug!(dest = %node, error = %err, "Radio send failed");
            }
        }
        result
    }

    fn receive(&self) -> Result<InboundStream, TransportError> {
        self.inbound.take()
    }

    async fn close(&self) {
        if !self.inner.lifecycle.close() {
            return;
        }

        self.inner.radio.shutdown();
        let task = self.receive_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        self.inner.events.emit(&TransportEvent::ConnectorClosed {
            kind: ConnectorKind::ZigBee,
        });
    }

    fn stats(&self) -> ConnectorStats {
        self.inner.stats.snapshot(self.inner.peers.len())
    }

    async fn discover(&self, platform: &str) -> Option<Port> {
        self.resolve(platform)
    }

    /// Broadcast a Join; every node that hears it answers with its name
    async fn refresh(&self) {
        if self.inner.lifecycle.is_closed() {
            return;
        }
        if let Err(err) = self.announce().await {
            tracing::debug!(error = %err, "Announce failed");
        }
    }
}

impl Drop for ZigBeeConnector {
    fn drop(&mut self) {
        if self.inner.lifecycle.close() {
            self.inner.radio.shutdown();
            if let Some(task) = self.receive_task.lock().take() {
                task.abort();
            }
        }
    }
}
