// connector/zigbee/radio.rs - Radio Link Abstraction
//
//! The seam between the ZigBee connector and the modem.
//!
//! A [`RadioLink`] moves single frames of at most `mtu` bytes between 16-bit
//! node addresses. Hardware drivers implement it for a real module;
//! [`SimulatedMedium`] implements it in memory with fault injection.

use crate::address::NodeId;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Default radio frame size, as used by XBee ZigBee modules
pub const DEFAULT_MTU: usize = 84;

/// Transmission failures reported by the modem
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum RadioError {
    #[error("Channel busy")]
    Busy,

    #[error("Collision")]
    Collision,

    #[error("No acknowledgement")]
    NoAck,

    #[error("No route to node")]
    NoRoute,

    #[error("Frame of {size} bytes exceeds MTU {mtu}")]
    FrameTooLarge { size: usize, mtu: usize },

    #[error("Radio closed")]
    Closed,
}

impl RadioError {
    /// Failures caused by channel contention, worth retrying after a backoff
    pub fn is_contention(&self) -> bool {
        matches!(self, RadioError::Busy | RadioError::Collision | RadioError::NoAck)
    }
}

/// Frame-level access to a radio modem
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Short address of this node
    fn node_id(&self) -> NodeId;

    /// Largest frame the modem transmits
    fn mtu(&self) -> usize;

    /// Transmit one frame. [`NodeId::BROADCAST`] reaches every node.
    async fn transmit(&self, dest: NodeId, frame: Bytes) -> Result<(), RadioError>;

    /// Next received frame with its sender; `None` once the radio is shut
    /// down. Must be cancel safe.
    async fn recv(&self) -> Option<(NodeId, Bytes)>;

    /// Stop receiving. Pending and later `recv` calls return `None`.
    fn shutdown(&self) {}
}

type FrameFilter = Box<dyn Fn(NodeId, NodeId, &[u8]) -> bool + Send + Sync>;

struct MediumInner {
    mtu: usize,
    nodes: DashMap<NodeId, mpsc::UnboundedSender<(NodeId, Bytes)>>,
    faults: Mutex<HashMap<NodeId, VecDeque<RadioError>>>,
    filter: Mutex<Option<FrameFilter>>,
    transmitted: AtomicU64,
}

/// In-memory radio channel shared by any number of nodes
#[derive(Clone)]
pub struct SimulatedMedium {
    inner: Arc<MediumInner>,
}

impl Default for SimulatedMedium {
    fn default() -> Self {
        Self::new(DEFAULT_MTU)
    }
}

impl SimulatedMedium {
    pub fn new(mtu: usize) -> Self {
        Self {
            inner: Arc::new(MediumInner {
                mtu,
                nodes: DashMap::new(),
                faults: Mutex::new(HashMap::new()),
                filter: Mutex::new(None),
                transmitted: AtomicU64::new(0),
            }),
        }
    }

    /// Join a node to the channel
    pub fn attach(&self, node: NodeId) -> Arc<SimRadio> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.nodes.insert(node, tx);
        Arc::new(SimRadio {
            node,
            medium: self.inner.clone(),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Remove a node; frames addressed to it fail with `NoRoute`
    pub fn detach(&self, node: NodeId) {
        self.inner.nodes.remove(&node);
    }

    /// Make the next transmissions from `node` fail with these errors, in order
    pub fn inject_faults(&self, node: NodeId, faults: impl IntoIterator<Item = RadioError>) {
        self.inner
            .faults
            .lock()
            .entry(node)
            .or_default()
            .extend(faults);
    }

    /// Silently lose every frame for which `keep(from, to, frame)` is false
    pub fn set_filter<F>(&self, keep: F)
    where
        F: Fn(NodeId, NodeId, &[u8]) -> bool + Send + Sync + 'static,
    {
        *self.inner.filter.lock() = Some(Box::new(keep));
    }

    pub fn clear_filter(&self) {
        self.inner.filter.lock().take();
    }

    /// Put arbitrary bytes on the air, bypassing MTU checks and faults
    pub fn deliver_raw(&self, from: NodeId, to: NodeId, frame: impl Into<Bytes>) {
        if let Some(node) = self.inner.nodes.get(&to) {
            let _ = node.send((from, frame.into()));
        }
    }

    /// Frames that made it onto the channel
    pub fn transmitted(&self) -> u64 {
        self.inner.transmitted.load(Ordering::Relaxed)
    }
}

impl MediumInner {
    fn keeps(&self, from: NodeId, to: NodeId, frame: &[u8]) -> bool {
        match &*self.filter.lock() {
            Some(keep) => keep(from, to, frame),
            None => true,
        }
    }

    fn transmit(&self, from: NodeId, dest: NodeId, frame: Bytes) -> Result<(), RadioError> {
        if frame.len() > self.mtu {
            return Err(RadioError::FrameTooLarge {
                size: frame.len(),
                mtu: self.mtu,
            });
        }
        if let Some(fault) = self.faults.lock().get_mut(&from).and_then(VecDeque::pop_front) {
            return Err(fault);
        }

        if dest.is_broadcast() {
            self.transmitted.fetch_add(1, Ordering::Relaxed);
            for node in self.nodes.iter() {
                if *node.key() != from && self.keeps(from, *node.key(), &frame) {
                    let _ = node.value().send((from, frame.clone()));
                }
            }
            return Ok(());
        }

        let Some(node) = self.nodes.get(&dest) else {
            return Err(RadioError::NoRoute);
        };
        self.transmitted.fetch_add(1, Ordering::Relaxed);
        if self.keeps(from, dest, &frame) {
            node.send((from, frame)).map_err(|_| RadioError::NoRoute)?;
        }
        Ok(())
    }
}

/// One node's view of a [`SimulatedMedium`]
pub struct SimRadio {
    node: NodeId,
    medium: Arc<MediumInner>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(NodeId, Bytes)>>,
}

#[async_trait]
impl RadioLink for SimRadio {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn mtu(&self) -> usize {
        self.medium.mtu
    }

    async fn transmit(&self, dest: NodeId, frame: Bytes) -> Result<(), RadioError> {
        if !self.medium.nodes.contains_key(&self.node) {
            return Err(RadioError::Closed);
        }
        self.medium.transmit(self.node, dest, frame)
    }

    async fn recv(&self) -> Option<(NodeId, Bytes)> {
        self.rx.lock().await.recv().await
    }

    fn shutdown(&self) {
        self.medium.nodes.remove(&self.node);
    }
}
