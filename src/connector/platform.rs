// connector/platform.rs - Inter-Platform TCP Connector
//
//! Cross-host transport between platforms over TCP.
//!
//! # Links
//!
//! Outbound traffic to one peer flows through a single link task that owns
//! the connection and a FIFO of queued envelopes:
//!
//! ```text
//! Disconnected -> Connecting -> Handshaking -> Connected
//!       ^                                          |
//!       +-------------- error / keep-alive --------+
//! ```
//!
//! Every `Data` frame carries a link-local id. A send completes when the
//! peer answers `DataAck` (delivered) or `DataReject` (refused, `Fatal`).
//! At most `ack_window` frames are in flight; further envelopes wait in the
//! link queue, and a full queue fails the send transiently.
//!
//! Frames still unacknowledged when the link drops are put back in front of
//! the queue and written again, in order, after the link comes back. The
//! receiver remembers the last id it delivered per sending link and only
//! acknowledges repeats, so a resent frame is delivered once. When
//! reconnection gives up, every queued send fails `Fatal` and the link is
//! discarded.
//!
//! # Handshake
//!
//! The connecting side sends `Hello`; the listening side answers `HelloAck`
//! or `Reject`. The listener binds the announced node name to the
//! connection and refuses envelopes whose source claims another platform.
//! Both sides remember the peer's name and listen address, which is what
//! [`Connector::discover`] answers from.

use super::{
    wrong_port, ActiveCount, Connector, ConnectorState, ConnectorStats, InboundStream, Lifecycle,
    ReceiveSlot, StatsCounters,
};
use crate::address::{ConnectorKind, Port};
use crate::codec::{read_frame, write_frame, FramingError, ReadFrame, DEFAULT_MAX_FRAME};
use crate::envelope::Envelope;
use crate::error::{ConnectionError, SendError, TransportError};
use crate::observability::{LinkState, SharedSink, TransportEvent};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Wire protocol version checked during the handshake
pub const PROTOCOL_VERSION: u16 = 2;

/// Frames exchanged between platforms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlatformFrame {
    Hello {
        node: String,
        session: Uuid,
        /// Sending link, unique within the session
        link: u64,
        /// Port the sender accepts platform connections on
        listen_port: u16,
        protocol_version: u16,
    },
    HelloAck {
        node: String,
        session: Uuid,
    },
    Reject {
        reason: String,
    },
    Data {
        id: u64,
        envelope: Envelope,
    },
    DataAck {
        id: u64,
    },
    DataReject {
        id: u64,
        reason: String,
    },
    Ping,
    Pong,
}

impl PlatformFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, FramingError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| FramingError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FramingError> {
        let (frame, used) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| FramingError::Decode(e.to_string()))?;
        if used != bytes.len() {
            return Err(FramingError::Decode(format!(
                "{} trailing bytes after frame",
                bytes.len() - used
            )));
        }
        Ok(frame)
    }

    fn name(&self) -> &'static str {
        match self {
            PlatformFrame::Hello { .. } => "Hello",
            PlatformFrame::HelloAck { .. } => "HelloAck",
            PlatformFrame::Reject { .. } => "Reject",
            PlatformFrame::Data { .. } => "Data",
            PlatformFrame::DataAck { .. } => "DataAck",
            PlatformFrame::DataReject { .. } => "DataReject",
            PlatformFrame::Ping => "Ping",
            PlatformFrame::Pong => "Pong",
        }
    }
}

/// Platform connector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Name announced in the handshake
    pub node_name: String,

    /// Address peers connect to
    pub listen_addr: SocketAddr,

    /// Node names allowed to connect; `None` admits everyone
    pub allowed_peers: Option<Vec<String>>,

    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Time allowed for Hello/HelloAck in milliseconds
    pub handshake_timeout_ms: u64,

    /// Time allowed for a single frame write in milliseconds
    pub write_timeout_ms: u64,

    /// Interval between pings in milliseconds
    pub keepalive_interval_ms: u64,

    /// A link without a pong for this long is dead, in milliseconds
    pub keepalive_timeout_ms: u64,

    /// Consecutive failed connection attempts before a link gives up
    pub max_reconnect_attempts: u32,

    /// First reconnect delay in milliseconds
    pub reconnect_base_delay_ms: u64,

    /// Reconnect delay cap in milliseconds
    pub reconnect_max_delay_ms: u64,

    /// Largest accepted frame body in bytes
    pub max_frame_size: u32,

    /// Envelopes a link queues before sends fail transiently
    pub queue_capacity: usize,

    /// Data frames written but not yet acknowledged, per link
    pub ack_window: usize,

    /// Inbound envelopes buffered before readers apply backpressure
    pub inbound_capacity: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            node_name: "hamas".into(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7700)),
            allowed_peers: None,
            connect_timeout_ms: 2_000,
            handshake_timeout_ms: 2_000,
            write_timeout_ms: 5_000,
            keepalive_interval_ms: 5_000,
            keepalive_timeout_ms: 15_000,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 5_000,
            max_frame_size: DEFAULT_MAX_FRAME,
            queue_capacity: 1024,
            ack_window: 64,
            inbound_capacity: 1024,
        }
    }
}

impl PlatformConfig {
    pub fn new(node_name: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            node_name: node_name.into(),
            listen_addr,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    /// Backoff used between reconnection attempts
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay_ms: self.reconnect_base_delay_ms,
            max_delay_ms: self.reconnect_max_delay_ms,
            jitter: 0.2,
        }
    }

    /// Whether a peer announcing `node` may connect
    pub fn admits(&self, node: &str) -> bool {
        match &self.allowed_peers {
            Some(allowed) => allowed.iter().any(|n| n == node),
            None => true,
        }
    }
}

/// One queued envelope and the sender waiting for its outcome
struct Outgoing {
    envelope: Envelope,
    ack: oneshot::Sender<Result<(), SendError>>,
}

/// An envelope taken off the link queue, numbered for acknowledgement
struct Tracked {
    id: u64,
    outgoing: Outgoing,
}

impl Tracked {
    fn settle(self, result: Result<(), SendError>) {
        let _ = self.outgoing.ack.send(result);
    }
}

#[derive(Clone)]
struct LinkHandle {
    id: u64,
    tx: mpsc::Sender<Outgoing>,
    state: Arc<Mutex<LinkState>>,
}

struct PlatformInner {
    config: PlatformConfig,
    local_addr: SocketAddr,
    session: Uuid,
    lifecycle: Lifecycle,
    stats: StatsCounters,
    events: SharedSink,
    links: DashMap<SocketAddr, LinkHandle>,
    next_link: AtomicU64,
    inbound_peers: AtomicUsize,
    /// Platform name to listen address, learned from handshakes
    peers: DashMap<String, SocketAddr>,
    /// Last delivered frame id per sending (session, link), with its node
    delivered: DashMap<(Uuid, u64), (String, u64)>,
    shutdown: watch::Sender<bool>,
}

impl PlatformInner {
    /// Queue an envelope on the peer's link, starting one if needed.
    ///
    /// Never suspends, so concurrent sends are queued in call order.
    fn enqueue(
        self: &Arc<Self>,
        addr: SocketAddr,
        envelope: Envelope,
    ) -> Result<oneshot::Receiver<Result<(), SendError>>, SendError> {
        let (ack, done) = oneshot::channel();
        let mut outgoing = Outgoing { envelope, ack };

        // a link may be terminating right now; retry once on a fresh one
        for _ in 0..2 {
            let handle = self
                .links
                .entry(addr)
                .or_insert_with(|| self.spawn_link(addr))
                .value()
                .clone();

            match handle.tx.try_send(outgoing) {
                Ok(()) => return Ok(done),
                Err(TrySendError::Full(_)) => {
                    return Err(SendError::transient(format!("link queue to {addr} is full")));
                }
                Err(TrySendError::Closed(returned)) => {
                    self.links.remove_if(&addr, |_, h| h.id == handle.id);
                    outgoing = returned;
                }
            }
        }

        Err(SendError::fatal(format!("no usable link to {addr}")))
    }

    fn spawn_link(self: &Arc<Self>, addr: SocketAddr) -> LinkHandle {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(Mutex::new(LinkState::Disconnected));

        let link = Link {
            inner: self.clone(),
            addr,
            id,
            state: state.clone(),
            next_frame: 0,
            pending: VecDeque::new(),
            unacked: VecDeque::new(),
        };
        tokio::spawn(link.run(rx));

        LinkHandle { id, tx, state }
    }

    fn framing_error(&self, peer: &str, err: &FramingError) {
        self.stats.framing_error();
        self.events.emit(&TransportEvent::FramingError {
            kind: ConnectorKind::Platform,
            peer: peer.to_string(),
            detail: err.to_string(),
        });
    }

    fn learn_peer(&self, node: &str, addr: SocketAddr) {
        let previous = self.peers.insert(node.to_string(), addr);
        if previous != Some(addr) {
            tracing::debug!(%node, %addr, "Platform peer learned");
        }
    }

    fn is_duplicate(&self, key: (Uuid, u64), id: u64) -> bool {
        self.delivered.get(&key).is_some_and(|entry| id <= entry.1)
    }

    fn mark_delivered(&self, key: (Uuid, u64), node: &str, id: u64) {
        self.delivered.insert(key, (node.to_string(), id));
    }

    /// A new session from `node` means its earlier sessions are gone
    fn forget_sessions(&self, node: &str, current: Uuid) {
        self.delivered
            .retain(|(session, _), (owner, _)| owner != node || *session == current);
    }

    fn connected_links(&self) -> usize {
        self.links
            .iter()
            .filter(|h| *h.state.lock() == LinkState::Connected)
            .count()
    }
}

/// TCP connector between platforms
pub struct PlatformConnector {
    inner: Arc<PlatformInner>,
    inbound: ReceiveSlot,
    server_task: Mutex<Option<JoinHandle<()>>>,
}

impl PlatformConnector {
    /// Bind the listen address and start accepting peers
    pub async fn open(config: PlatformConfig, events: SharedSink) -> Result<Self, ConnectionError> {
        if config.node_name.is_empty() || config.node_name.contains('/') {
            return Err(ConnectionError::InvalidConfig(format!(
                "invalid node name '{}'",
                config.node_name
            )));
        }

        let listener = bind_listener(config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(PlatformInner {
            config,
            local_addr,
            session: Uuid::new_v4(),
            lifecycle: Lifecycle::new(),
            stats: StatsCounters::default(),
            events: events.clone(),
            links: DashMap::new(),
            next_link: AtomicU64::new(0),
            inbound_peers: AtomicUsize::new(0),
            peers: DashMap::new(),
            delivered: DashMap::new(),
            shutdown,
        });

        let server_task = tokio::spawn(accept_loop(listener, inner.clone(), tx));

        tracing::info!(
            node = %inner.config.node_name,
            addr = %local_addr,
            session = %inner.session,
            "Platform connector listening"
        );
        events.emit(&TransportEvent::ConnectorOpened {
            kind: ConnectorKind::Platform,
            address: local_addr.to_string(),
        });

        Ok(Self {
            inner,
            inbound: ReceiveSlot::new(ReceiverStream::new(rx).boxed()),
            server_task: Mutex::new(Some(server_task)),
        })
    }

    /// Bound listen address (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Session id announced in handshakes, fresh per instance
    pub fn session(&self) -> Uuid {
        self.inner.session
    }

    /// State of the outbound link to a peer, if one exists
    pub fn link_state(&self, addr: SocketAddr) -> Option<LinkState> {
        self.inner.links.get(&addr).map(|h| *h.state.lock())
    }

    /// Peers with an outbound link
    pub fn links(&self) -> Vec<SocketAddr> {
        self.inner.links.iter().map(|h| *h.key()).collect()
    }

    /// Platforms met in a handshake, by name
    pub fn peers(&self) -> HashMap<String, SocketAddr> {
        self.inner
            .peers
            .iter()
            .map(|p| (p.key().clone(), *p.value()))
            .collect()
    }
}

#[async_trait]
impl Connector for PlatformConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Platform
    }

    fn local_port(&self) -> Port {
        Port::Platform(self.inner.local_addr)
    }

    fn state(&self) -> ConnectorState {
        self.inner.lifecycle.state()
    }

    async fn send(&self, port: &Port, envelope: &Envelope) -> Result<(), SendError> {
        if self.inner.lifecycle.is_closed() {
            return Err(SendError::fatal("platform connector is closed"));
        }
        let Port::Platform(addr) = port else {
            return Err(wrong_port(ConnectorKind::Platform, port));
        };

        let result = match self.inner.enqueue(*addr, envelope.clone()) {
            Ok(done) => done
                .await
                .unwrap_or_else(|_| Err(SendError::fatal(format!("link to {addr} terminated")))),
            Err(err) => Err(err),
        };

        match &result {
            Ok(()) => self.inner.stats.sent(envelope.payload().len()),
            Err(_) => self.inner.stats.send_failed(),
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

        self.inner.shutdown.send_replace(true);
        let task = self.server_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.inner.events.emit(&TransportEvent::ConnectorClosed {
            kind: ConnectorKind::Platform,
        });
    }

    fn stats(&self) -> ConnectorStats {
        let active = self.inner.connected_links()
            + self.inner.inbound_peers.load(Ordering::Relaxed);
        self.inner.stats.snapshot(active)
    }

    async fn discover(&self, platform: &str) -> Option<Port> {
        self.inner.peers.get(platform).map(|addr| Port::Platform(*addr))
    }
}

impl Drop for PlatformConnector {
    fn drop(&mut self) {
        if self.inner.lifecycle.close() {
            self.inner.shutdown.send_replace(true);
            if let Some(task) = self.server_task.lock().take() {
                task.abort();
            }
        }
    }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    // a restarted platform rebinds its address right away
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// One read off a platform connection
enum Incoming {
    Frame(PlatformFrame),
    /// Body did not decode; the stream is still aligned
    Malformed(FramingError),
    /// Oversized or truncated; the stream is unusable
    Broken(FramingError),
    Closed,
    Io(std::io::Error),
}

async fn next_frame<R>(reader: &mut R, max_frame: u32) -> Incoming
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, max_frame).await {
        Ok(Ok(ReadFrame::Frame(body))) => match PlatformFrame::from_bytes(&body) {
            Ok(frame) => Incoming::Frame(frame),
            Err(err) => Incoming::Malformed(err),
        },
        Ok(Ok(ReadFrame::Closed)) => Incoming::Closed,
        Ok(Err(err)) => Incoming::Broken(err),
        Err(e) => Incoming::Io(e),
    }
}

async fn send_frame<W>(writer: &mut W, frame: &PlatformFrame, timeout: Duration) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.to_bytes().map_err(|e| e.to_string())?;
    write_body(writer, &body, timeout).await
}

async fn write_body<W>(writer: &mut W, body: &[u8], timeout: Duration) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, write_frame(writer, body)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write timed out after {timeout:?}")),
    }
}

// ============================================================================
// Outbound links
// ============================================================================

enum ConnectFailure {
    /// The peer refused us; reconnecting would not help
    Rejected(String),
    Failed(String),
}

enum LinkExit {
    Shutdown,
    Disconnected(String),
}

enum LinkSignal {
    Pong,
    Acked(u64),
    Refused { id: u64, reason: String },
    Closed(String),
}

struct Link {
    inner: Arc<PlatformInner>,
    addr: SocketAddr,
    id: u64,
    state: Arc<Mutex<LinkState>>,
    /// Id of the next frame taken off the queue
    next_frame: u64,
    /// Envelopes taken off the queue but not yet written
    pending: VecDeque<Tracked>,
    /// Written, waiting for DataAck, in frame order
    unacked: VecDeque<Tracked>,
}

impl Link {
    async fn run(mut self, mut rx: mpsc::Receiver<Outgoing>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let policy = self.inner.config.reconnect_policy();
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                self.terminate(&mut rx, SendError::fatal("platform connector closed"));
                return;
            }

            let attempt = tokio::select! {
                _ = shutdown.changed() => continue,
                attempt = self.connect() => attempt,
            };

            match attempt {
                Ok(stream) => {
                    failures = 0;
                    let exit = self.serve(stream, &mut rx, &mut shutdown).await;
                    self.set_state(LinkState::Disconnected);
                    match exit {
                        LinkExit::Shutdown => {
                            self.terminate(&mut rx, SendError::fatal("platform connector closed"));
                            return;
                        }
                        LinkExit::Disconnected(reason) => {
                            tracing::warn!(peer = %self.addr, %reason, "Platform link lost");
                        }
                    }
                }
                Err(ConnectFailure::Rejected(reason)) => {
                    self.set_state(LinkState::Disconnected);
                    tracing::warn!(peer = %self.addr, %reason, "Handshake rejected");
                    self.terminate(
                        &mut rx,
                        SendError::fatal(format!("rejected by {}: {reason}", self.addr)),
                    );
                    return;
                }
                Err(ConnectFailure::Failed(reason)) => {
                    self.set_state(LinkState::Disconnected);
                    failures += 1;
                    if failures >= policy.max_attempts.max(1) {
                        self.terminate(
                            &mut rx,
                            SendError::fatal(format!(
                                "{} unreachable after {failures} attempts: {reason}",
                                self.addr
                            )),
                        );
                        return;
                    }

                    let delay = policy.backoff(failures - 1);
                    tracing::debug!(
                        peer = %self.addr,
                        attempt = failures,
                        ?delay,
                        %reason,
                        "Reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn set_state(&self, to: LinkState) {
        let from = std::mem::replace(&mut *self.state.lock(), to);
        if from != to {
            self.inner.events.emit(&TransportEvent::LinkStateChanged {
                kind: ConnectorKind::Platform,
                peer: self.addr.to_string(),
                from,
                to,
            });
        }
    }

    async fn connect(&mut self) -> Result<TcpStream, ConnectFailure> {
        let config = &self.inner.config;
        self.set_state(LinkState::Connecting);

        let mut stream =
            match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(self.addr))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(ConnectFailure::Failed(e.to_string())),
                Err(_) => return Err(ConnectFailure::Failed("connect timed out".into())),
            };
        let _ = stream.set_nodelay(true);

        self.set_state(LinkState::Handshaking);
        let hello = PlatformFrame::Hello {
            node: config.node_name.clone(),
            session: self.inner.session,
            link: self.id,
            listen_port: self.inner.local_addr.port(),
            protocol_version: PROTOCOL_VERSION,
        };
        send_frame(&mut stream, &hello, config.write_timeout())
            .await
            .map_err(ConnectFailure::Failed)?;

        let reply = tokio::time::timeout(
            config.handshake_timeout(),
            next_frame(&mut stream, config.max_frame_size),
        )
        .await
        .map_err(|_| ConnectFailure::Failed("handshake timed out".into()))?;

        match reply {
            Incoming::Frame(PlatformFrame::HelloAck { node, session }) => {
                tracing::info!(peer = %self.addr, %node, %session, "Platform link established");
                self.inner.learn_peer(&node, self.addr);
                self.set_state(LinkState::Connected);
                Ok(stream)
            }
            Incoming::Frame(PlatformFrame::Reject { reason }) => Err(ConnectFailure::Rejected(reason)),
            Incoming::Frame(other) => Err(ConnectFailure::Failed(format!(
                "unexpected {} during handshake",
                other.name()
            ))),
            Incoming::Closed => Err(ConnectFailure::Failed("peer closed during handshake".into())),
            Incoming::Malformed(err) | Incoming::Broken(err) => {
                Err(ConnectFailure::Failed(err.to_string()))
            }
            Incoming::Io(e) => Err(ConnectFailure::Failed(e.to_string())),
        }
    }

    async fn serve(
        &mut self,
        stream: TcpStream,
        rx: &mut mpsc::Receiver<Outgoing>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkExit {
        let (reader, mut writer) = stream.into_split();
        let (signal_tx, mut signals) = mpsc::channel(64);
        let reader_task = tokio::spawn(link_reader(
            reader,
            self.inner.config.max_frame_size,
            signal_tx,
        ));

        let exit = self.pump(&mut writer, rx, &mut signals, shutdown).await;
        reader_task.abort();
        self.requeue_unacked();
        exit
    }

    async fn pump(
        &mut self,
        writer: &mut OwnedWriteHalf,
        rx: &mut mpsc::Receiver<Outgoing>,
        signals: &mut mpsc::Receiver<LinkSignal>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkExit {
        let config = self.inner.config.clone();
        let interval = config.keepalive_interval();
        let mut keepalive = tokio::time::interval_at(Instant::now() + interval, interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong: Option<Instant> = None;
        let window = config.ack_window.max(1);

        loop {
            while self.unacked.len() < window {
                let Some(head) = self.pending.front() else {
                    break;
                };
                let frame = PlatformFrame::Data {
                    id: head.id,
                    envelope: head.outgoing.envelope.clone(),
                };
                let body = match frame.to_bytes() {
                    Ok(body) if body.len() <= config.max_frame_size as usize => body,
                    Ok(body) => {
                        let reason = format!(
                            "envelope of {} bytes exceeds frame limit {}",
                            body.len(),
                            config.max_frame_size
                        );
                        self.fail_head(SendError::fatal(reason));
                        continue;
                    }
                    Err(err) => {
                        self.fail_head(SendError::fatal(err.to_string()));
                        continue;
                    }
                };

                // a partial write is repaired by resending after reconnect
                if let Err(reason) = write_body(writer, &body, config.write_timeout()).await {
                    return LinkExit::Disconnected(reason);
                }
                if let Some(written) = self.pending.pop_front() {
                    self.unacked.push_back(written);
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return LinkExit::Shutdown,
                signal = signals.recv() => match signal {
                    Some(LinkSignal::Pong) => awaiting_pong = None,
                    Some(LinkSignal::Acked(id)) => self.settle(id, Ok(())),
                    Some(LinkSignal::Refused { id, reason }) => {
                        self.settle(id, Err(SendError::fatal(reason)));
                    }
                    Some(LinkSignal::Closed(reason)) => return LinkExit::Disconnected(reason),
                    None => return LinkExit::Disconnected("reader stopped".into()),
                },
                // with the window full the queue backs up and sends fail transiently
                outgoing = rx.recv(), if self.pending.is_empty() => match outgoing {
                    Some(outgoing) => {
                        let id = self.next_frame;
                        self.next_frame += 1;
                        self.pending.push_back(Tracked { id, outgoing });
                    }
                    None => return LinkExit::Shutdown,
                },
                _ = keepalive.tick() => match awaiting_pong {
                    Some(sent) if sent.elapsed() >= config.keepalive_timeout() => {
                        return LinkExit::Disconnected("keep-alive timeout".into());
                    }
                    Some(_) => {}
                    None => {
                        if let Err(reason) =
                            send_frame(writer, &PlatformFrame::Ping, config.write_timeout()).await
                        {
                            return LinkExit::Disconnected(reason);
                        }
                        awaiting_pong = Some(Instant::now());
                    }
                },
            }
        }
    }

    fn fail_head(&mut self, err: SendError) {
        if let Some(tracked) = self.pending.pop_front() {
            tracked.settle(Err(err));
        }
    }

    /// Complete the in-flight frame `id`. Repeated acks find nothing.
    fn settle(&mut self, id: u64, result: Result<(), SendError>) {
        let Some(pos) = self.unacked.iter().position(|t| t.id == id) else {
            tracing::trace!(peer = %self.addr, id, "Acknowledgement for no frame in flight");
            return;
        };
        if let Some(tracked) = self.unacked.remove(pos) {
            tracked.settle(result);
        }
    }

    /// Put unacknowledged frames back in front of the queue, keeping order
    fn requeue_unacked(&mut self) {
        if self.unacked.is_empty() {
            return;
        }
        tracing::debug!(
            peer = %self.addr,
            frames = self.unacked.len(),
            "Requeueing unacknowledged frames"
        );
        while let Some(tracked) = self.unacked.pop_back() {
            self.pending.push_front(tracked);
        }
    }

    /// Remove the link and fail everything still queued on it
    fn terminate(&mut self, rx: &mut mpsc::Receiver<Outgoing>, err: SendError) {
        let id = self.id;
        self.inner.links.remove_if(&self.addr, |_, h| h.id == id);
        rx.close();

        let mut failed = 0usize;
        for tracked in self.unacked.drain(..).chain(self.pending.drain(..)) {
            tracked.settle(Err(err.clone()));
            failed += 1;
        }
        while let Ok(outgoing) = rx.try_recv() {
            let _ = outgoing.ack.send(Err(err.clone()));
            failed += 1;
        }

        if failed > 0 {
            tracing::warn!(peer = %self.addr, failed, error = %err, "Dropped queued envelopes");
        }
    }
}

async fn link_reader(
    mut reader: OwnedReadHalf,
    max_frame: u32,
    signals: mpsc::Sender<LinkSignal>,
) {
    loop {
        let signal = match next_frame(&mut reader, max_frame).await {
            Incoming::Frame(PlatformFrame::Pong) => LinkSignal::Pong,
            Incoming::Frame(PlatformFrame::DataAck { id }) => LinkSignal::Acked(id),
            Incoming::Frame(PlatformFrame::DataReject { id, reason }) => {
                LinkSignal::Refused { id, reason }
            }
            Incoming::Frame(other) => {
                tracing::debug!(frame = other.name(), "Ignoring frame on outbound link");
                continue;
            }
            Incoming::Malformed(err) => {
                tracing::debug!(error = %err, "Malformed frame on outbound link");
                continue;
            }
            Incoming::Closed => LinkSignal::Closed("peer closed the connection".into()),
            Incoming::Broken(err) => LinkSignal::Closed(err.to_string()),
            Incoming::Io(e) => LinkSignal::Closed(e.to_string()),
        };

        let closed = matches!(signal, LinkSignal::Closed(_));
        if signals.send(signal).await.is_err() || closed {
            return;
        }
    }
}

// ============================================================================
// Inbound connections
// ============================================================================

async fn accept_loop(listener: TcpListener, inner: Arc<PlatformInner>, tx: mpsc::Sender<Envelope>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut peers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let _ = stream.set_nodelay(true);
                    peers.spawn(serve_peer(stream, remote, inner.clone(), tx.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Platform accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            Some(_) = peers.join_next(), if !peers.is_empty() => {}
        }
    }

    peers.shutdown().await;
}

/// Identity a connecting peer announced in its accepted Hello
struct PeerHello {
    node: String,
    session: Uuid,
    link: u64,
    listen_port: u16,
}

/// Answer a Hello
async fn accept_handshake(stream: &mut TcpStream, inner: &PlatformInner) -> Result<PeerHello, String> {
    let config = &inner.config;
    let hello = tokio::time::timeout(
        config.handshake_timeout(),
        next_frame(stream, config.max_frame_size),
    )
    .await
    .map_err(|_| "handshake timed out".to_string())?;

    let (hello, version) = match hello {
        Incoming::Frame(PlatformFrame::Hello {
            node,
            session,
            link,
            listen_port,
            protocol_version,
        }) => (
            PeerHello {
                node,
                session,
                link,
                listen_port,
            },
            protocol_version,
        ),
        Incoming::Frame(other) => return Err(format!("expected Hello, got {}", other.name())),
        _ => return Err("connection ended before Hello".into()),
    };

    let refusal = if version != PROTOCOL_VERSION {
        Some(format!("unsupported protocol version {version}"))
    } else if !config.admits(&hello.node) {
        Some(format!("peer '{}' is not allowed", hello.node))
    } else {
        None
    };

    if let Some(reason) = refusal {
        let reject = PlatformFrame::Reject {
            reason: reason.clone(),
        };
        let _ = send_frame(stream, &reject, config.write_timeout()).await;
        return Err(reason);
    }

    let ack = PlatformFrame::HelloAck {
        node: config.node_name.clone(),
        session: inner.session,
    };
    send_frame(stream, &ack, config.write_timeout()).await?;
    tracing::debug!(node = %hello.node, session = %hello.session, link = hello.link, "Handshake accepted");
    Ok(hello)
}

async fn serve_peer(
    mut stream: TcpStream,
    remote: SocketAddr,
    inner: Arc<PlatformInner>,
    tx: mpsc::Sender<Envelope>,
) {
    let peer = remote.to_string();
    let hello = match accept_handshake(&mut stream, &inner).await {
        Ok(hello) => hello,
        Err(reason) => {
            tracing::info!(%peer, %reason, "Platform peer refused");
            return;
        }
    };
    let node = hello.node;
    let key = (hello.session, hello.link);
    inner.learn_peer(&node, SocketAddr::new(remote.ip(), hello.listen_port));
    inner.forget_sessions(&node, hello.session);

    let _active = ActiveCount::new(&inner.inbound_peers);
    let mut shutdown = inner.shutdown.subscribe();
    let max_frame = inner.config.max_frame_size;
    let write_timeout = inner.config.write_timeout();
    tracing::info!(%peer, %node, "Platform peer connected");

    loop {
        let incoming = tokio::select! {
            _ = shutdown.changed() => break,
            incoming = next_frame(&mut stream, max_frame) => incoming,
        };

        let reply = match incoming {
            Incoming::Frame(PlatformFrame::Data { id, envelope }) => {
                if inner.is_duplicate(key, id) {
                    tracing::debug!(%peer, %node, id, "Repeated frame acknowledged again");
                    PlatformFrame::DataAck { id }
                } else if envelope.source().platform().is_some_and(|claimed| claimed != node) {
                    tracing::warn!(
                        %peer,
                        %node,
                        source = %envelope.source(),
                        "Envelope source does not match peer identity, refused"
                    );
                    PlatformFrame::DataReject {
                        id,
                        reason: format!(
                            "source {} does not belong to platform '{node}'",
                            envelope.source()
                        ),
                    }
                } else {
                    let bytes = envelope.payload().len();
                    if tx.send(envelope).await.is_err() {
                        break;
                    }
                    inner.stats.received(bytes);
                    inner.mark_delivered(key, &node, id);
                    PlatformFrame::DataAck { id }
                }
            }
            Incoming::Frame(PlatformFrame::Ping) => PlatformFrame::Pong,
            Incoming::Frame(other) => {
                tracing::debug!(%peer, frame = other.name(), "Unexpected frame from peer");
                continue;
            }
            Incoming::Malformed(err) => {
                inner.framing_error(&peer, &err);
                continue;
            }
            Incoming::Broken(err) => {
                inner.framing_error(&peer, &err);
                break;
            }
            Incoming::Closed => break,
            Incoming::Io(e) => {
                tracing::debug!(%peer, error = %e, "Platform connection read failed");
                break;
            }
        };

        if let Err(reason) = send_frame(&mut stream, &reply, write_timeout).await {
            tracing::debug!(%peer, %reason, frame = reply.name(), "Reply failed");
            break;
        }
    }

    tracing::info!(%peer, %node, "Platform peer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;
    use crate::observability::MemorySink;
    use tokio::io::AsyncWriteExt;

    fn config(name: &str) -> PlatformConfig {
        PlatformConfig {
            reconnect_base_delay_ms: 10,
            reconnect_max_delay_ms: 50,
            max_reconnect_attempts: 200,
            ..PlatformConfig::new(name, "127.0.0.1:0".parse().unwrap())
        }
    }

    async fn open(config: PlatformConfig) -> (PlatformConnector, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let connector = PlatformConnector::open(config, sink.clone()).await.unwrap();
        (connector, sink)
    }

    fn envelope(source: &str, seq: u64, payload: &[u8]) -> Envelope {
        Envelope::new(source.parse().unwrap(), "beta/b".parse().unwrap(), payload.to_vec(), seq)
    }

    /// Handshaken connection that speaks frames by hand
    async fn raw_peer(beta: &PlatformConnector, node: &str) -> TcpStream {
        let mut raw = TcpStream::connect(beta.local_addr()).await.unwrap();
        let hello = PlatformFrame::Hello {
            node: node.into(),
            session: Uuid::new_v4(),
            link: 0,
            listen_port: 7700,
            protocol_version: PROTOCOL_VERSION,
        };
        raw.write_all(&encode_frame(&hello.to_bytes().unwrap()))
            .await
            .unwrap();
        assert!(matches!(
            next_frame(&mut raw, DEFAULT_MAX_FRAME).await,
            Incoming::Frame(PlatformFrame::HelloAck { .. })
        ));
        raw
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_handshake_and_delivery() {
        let (alpha, sink) = open(config("alpha")).await;
        let (beta, _) = open(config("beta")).await;
        let mut inbound = beta.receive().unwrap();

        alpha
            .send(&beta.local_port(), &envelope("alpha/a", 0, b"hello"))
            .await
            .unwrap();
        let env = inbound.next().await.unwrap();
        assert_eq!(env.payload(), b"hello");
        assert_eq!(alpha.link_state(beta.local_addr()), Some(LinkState::Connected));

        let transitions: Vec<LinkState> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::LinkStateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![LinkState::Connecting, LinkState::Handshaking, LinkState::Connected]
        );
    }

    #[tokio::test]
    async fn test_reconnect_delivers_queued_in_order_once() {
        let (alpha, _) = open(config("alpha")).await;
        let (beta, _) = open(config("beta")).await;
        let addr = beta.local_addr();
        let port = Port::Platform(addr);
        let mut inbound = beta.receive().unwrap();

        alpha.send(&port, &envelope("alpha/a", 1, b"m1")).await.unwrap();
        assert_eq!(inbound.next().await.unwrap().payload(), b"m1");

        beta.close().await;
        assert!(inbound.next().await.is_none());
        wait_until(|| alpha.link_state(addr) != Some(LinkState::Connected)).await;

        let restart = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            PlatformConnector::open(
                PlatformConfig {
                    listen_addr: addr,
                    ..config("beta")
                },
                Arc::new(MemorySink::new()),
            )
            .await
            .unwrap()
        };
        let m2 = envelope("alpha/a", 2, b"m2");
        let m3 = envelope("alpha/a", 3, b"m3");
        let (r2, r3, beta) = tokio::join!(alpha.send(&port, &m2), alpha.send(&port, &m3), restart);
        r2.unwrap();
        r3.unwrap();

        let mut inbound = beta.receive().unwrap();
        assert_eq!(inbound.next().await.unwrap().payload(), b"m2");
        assert_eq!(inbound.next().await.unwrap().payload(), b"m3");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), inbound.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_rejected_peer_is_fatal_without_reconnect() {
        let (alpha, _) = open(config("alpha")).await;
        let (beta, _) = open(PlatformConfig {
            allowed_peers: Some(vec!["gamma".into()]),
            ..config("beta")
        })
        .await;

        let err = alpha
            .send(&beta.local_port(), &envelope("alpha/a", 0, b"let me in"))
            .await
            .unwrap_err();
        match err {
            SendError::Fatal(reason) => assert!(reason.contains("not allowed")),
            other => panic!("expected fatal, got {other:?}"),
        }
        assert_eq!(alpha.link_state(beta.local_addr()), None);
    }

    #[tokio::test]
    async fn test_exhausted_reconnection_fails_queued_sends() {
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = dead.local_addr().unwrap();
        drop(dead);

        let (alpha, _) = open(PlatformConfig {
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 5,
            ..config("alpha")
        })
        .await;

        let port = Port::Platform(addr);
        let a = envelope("alpha/a", 0, b"a");
        let b = envelope("alpha/a", 1, b"b");
        let (ra, rb) = tokio::join!(alpha.send(&port, &a), alpha.send(&port, &b));
        assert!(matches!(ra, Err(SendError::Fatal(_))));
        assert!(matches!(rb, Err(SendError::Fatal(_))));
        assert_eq!(alpha.link_state(addr), None);
        assert_eq!(alpha.stats().send_failures, 2);
    }

    #[tokio::test]
    async fn test_spoofed_source_dropped() {
        let (alpha, _) = open(config("alpha")).await;
        let (beta, _) = open(config("beta")).await;
        let mut inbound = beta.receive().unwrap();
        let port = beta.local_port();

        let err = alpha
            .send(&port, &envelope("mallory/m", 0, b"spoof"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Fatal(ref reason) if reason.contains("mallory/m")));
        alpha.send(&port, &envelope("alpha/a", 1, b"genuine")).await.unwrap();
        alpha.send(&port, &envelope("plain", 2, b"unqualified")).await.unwrap();

        assert_eq!(inbound.next().await.unwrap().payload(), b"genuine");
        assert_eq!(inbound.next().await.unwrap().payload(), b"unqualified");
        assert_eq!(beta.stats().messages_received, 2);
    }

    #[tokio::test]
    async fn test_protocol_version_mismatch_rejected() {
        let (beta, _) = open(config("beta")).await;
        let mut raw = TcpStream::connect(beta.local_addr()).await.unwrap();
        let hello = PlatformFrame::Hello {
            node: "future".into(),
            session: Uuid::new_v4(),
            link: 0,
            listen_port: 7700,
            protocol_version: 99,
        };
        raw.write_all(&encode_frame(&hello.to_bytes().unwrap()))
            .await
            .unwrap();

        match next_frame(&mut raw, DEFAULT_MAX_FRAME).await {
            Incoming::Frame(PlatformFrame::Reject { reason }) => {
                assert!(reason.contains("protocol version"))
            }
            _ => panic!("expected Reject"),
        }
    }

    #[tokio::test]
    async fn test_missing_pong_disconnects_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _hello = next_frame(&mut stream, DEFAULT_MAX_FRAME).await;
            let ack = PlatformFrame::HelloAck {
                node: "mute".into(),
                session: Uuid::new_v4(),
            };
            send_frame(&mut stream, &ack, Duration::from_secs(1))
                .await
                .unwrap();
            // never answers pings
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let (alpha, sink) = open(PlatformConfig {
            keepalive_interval_ms: 20,
            keepalive_timeout_ms: 60,
            ..config("alpha")
        })
        .await;
        let port = Port::Platform(addr);
        let env = envelope("alpha/a", 0, b"x");
        let dropped = wait_until(|| {
            !sink
                .matching(|e| {
                    matches!(
                        e,
                        TransportEvent::LinkStateChanged {
                            from: LinkState::Connected,
                            to: LinkState::Disconnected,
                            ..
                        }
                    )
                })
                .is_empty()
        });

        // the mute peer never acknowledges, so the send stays pending
        tokio::select! {
            result = alpha.send(&port, &env) => panic!("send completed without ack: {result:?}"),
            _ = dropped => {}
        }
    }

    #[tokio::test]
    async fn test_malformed_inbound_frame_skipped() {
        let (beta, sink) = open(config("beta")).await;
        let mut inbound = beta.receive().unwrap();

        let mut raw = raw_peer(&beta, "alpha").await;

        raw.write_all(&encode_frame(b"\xEE\xEE\xEE")).await.unwrap();
        let data = PlatformFrame::Data {
            id: 0,
            envelope: envelope("alpha/a", 9, b"fine"),
        };
        raw.write_all(&encode_frame(&data.to_bytes().unwrap()))
            .await
            .unwrap();

        assert_eq!(inbound.next().await.unwrap().sequence(), 9);
        assert_eq!(beta.stats().framing_errors, 1);
        assert_eq!(
            sink.matching(|e| matches!(e, TransportEvent::FramingError { .. }))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_unacknowledged_frame_resent_after_peer_restart() {
        let (alpha, _) = open(config("alpha")).await;
        let (beta, _) = open(config("beta")).await;
        let addr = beta.local_addr();
        let port = Port::Platform(addr);
        let mut inbound = beta.receive().unwrap();

        alpha.send(&port, &envelope("alpha/a", 1, b"m1")).await.unwrap();
        assert_eq!(inbound.next().await.unwrap().payload(), b"m1");

        // the link may still look connected; m2 can land in a dead socket
        beta.close().await;
        drop(inbound);
        let m2 = envelope("alpha/a", 2, b"m2");
        let restart = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            PlatformConnector::open(
                PlatformConfig {
                    listen_addr: addr,
                    ..config("beta")
                },
                Arc::new(MemorySink::new()),
            )
            .await
            .unwrap()
        };
        let (r2, beta) = tokio::join!(alpha.send(&port, &m2), restart);
        r2.unwrap();

        alpha.send(&port, &envelope("alpha/a", 3, b"m3")).await.unwrap();
        let mut inbound = beta.receive().unwrap();
        assert_eq!(inbound.next().await.unwrap().payload(), b"m2");
        assert_eq!(inbound.next().await.unwrap().payload(), b"m3");
    }

    #[tokio::test]
    async fn test_repeated_frame_delivered_once() {
        let (beta, _) = open(config("beta")).await;
        let mut inbound = beta.receive().unwrap();
        let mut raw = raw_peer(&beta, "alpha").await;

        let data = PlatformFrame::Data {
            id: 5,
            envelope: envelope("alpha/a", 5, b"once"),
        };
        let bytes = encode_frame(&data.to_bytes().unwrap());
        raw.write_all(&bytes).await.unwrap();
        raw.write_all(&bytes).await.unwrap();

        for _ in 0..2 {
            assert!(matches!(
                next_frame(&mut raw, DEFAULT_MAX_FRAME).await,
                Incoming::Frame(PlatformFrame::DataAck { id: 5 })
            ));
        }
        assert_eq!(inbound.next().await.unwrap().payload(), b"once");
        assert!(
            tokio::time::timeout(Duration::from_millis(100), inbound.next())
                .await
                .is_err()
        );
        assert_eq!(beta.stats().messages_received, 1);
    }

    #[tokio::test]
    async fn test_full_window_backs_up_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _hello = next_frame(&mut stream, DEFAULT_MAX_FRAME).await;
            let ack = PlatformFrame::HelloAck {
                node: "slow".into(),
                session: Uuid::new_v4(),
            };
            send_frame(&mut stream, &ack, Duration::from_secs(1))
                .await
                .unwrap();
            // reads frames, never acknowledges
            while let Incoming::Frame(_) = next_frame(&mut stream, DEFAULT_MAX_FRAME).await {}
        });

        let (alpha, _) = open(PlatformConfig {
            ack_window: 2,
            queue_capacity: 1,
            ..config("alpha")
        })
        .await;
        let port = Port::Platform(addr);

        // two frames in flight, one held for the window, one in the queue;
        // the next send finds the queue full
        let mut waiting = 0;
        let mut transient = false;
        for seq in 0..10 {
            let env = envelope("alpha/a", seq, b"w");
            let send = alpha.send(&port, &env);
            match tokio::time::timeout(Duration::from_millis(100), send).await {
                Ok(Ok(())) => panic!("send acknowledged by a peer that never acks"),
                Ok(Err(err)) => {
                    transient = err.is_transient();
                    break;
                }
                Err(_) => waiting += 1,
            }
        }
        assert!(transient);
        assert!(waiting >= 3);
    }

    #[tokio::test]
    async fn test_handshake_teaches_peer_addresses() {
        let (alpha, _) = open(config("alpha")).await;
        let (beta, _) = open(config("beta")).await;

        assert_eq!(alpha.discover("beta").await, None);
        alpha
            .send(&beta.local_port(), &envelope("alpha/a", 0, b"hi"))
            .await
            .unwrap();

        assert_eq!(alpha.discover("beta").await, Some(beta.local_port()));
        assert_eq!(beta.discover("alpha").await, Some(alpha.local_port()));
        assert_eq!(beta.peers().len(), 1);
    }
}
