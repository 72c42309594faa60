// connector/unix.rs - Unix Domain Socket Connector
//
//! Same-host IPC between platforms.
//!
//! Every platform binds one daemon socket at `<socket_dir>/<node_name>`.
//! Peers connect to it and write length-prefixed envelopes; replies travel
//! back over the sender's own daemon socket, so connections are one-way.
//!
//! Outbound connections are cached per socket path. Writers take a per
//! connection lock, so frames from concurrent senders never interleave. A
//! write that fails half way poisons the connection; it is dropped from the
//! cache and the next send opens a fresh one. A cached connection whose
//! peer restarted fails with a broken pipe; the send reconnects once before
//! reporting it.

use super::{
    wrong_port, ActiveCount, Connector, ConnectorState, ConnectorStats, InboundStream, Lifecycle,
    ReceiveSlot, StatsCounters,
};
use crate::address::{ConnectorKind, Port};
use crate::codec::{read_frame, write_frame, FramingError, ReadFrame, DEFAULT_MAX_FRAME};
use crate::envelope::Envelope;
use crate::error::{ConnectionError, SendError, TransportError};
use crate::observability::{SharedSink, TransportEvent};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::ReceiverStream;

/// Directory holding the daemon sockets of all platforms on this host
pub const DEFAULT_SOCKET_DIR: &str = "/tmp/hamas_sockets";

/// Unix connector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnixConfig {
    /// Shared socket directory
    pub socket_dir: PathBuf,

    /// Name of this platform; also the socket file name
    pub node_name: String,

    /// A write that does not finish within this window fails transiently
    pub write_timeout_ms: u64,

    /// Largest accepted frame body in bytes
    pub max_frame_size: u32,

    /// Inbound envelopes buffered before readers apply backpressure
    pub inbound_capacity: usize,
}

impl Default for UnixConfig {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            node_name: "hamas".into(),
            write_timeout_ms: 1_000,
            max_frame_size: DEFAULT_MAX_FRAME,
            inbound_capacity: 1024,
        }
    }
}

impl UnixConfig {
    pub fn new(socket_dir: impl Into<PathBuf>, node_name: impl Into<String>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    /// Daemon socket path of this platform
    pub fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(&self.node_name)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

struct Outbound {
    stream: UnixStream,
    /// Set after a failed or partial write; the stream position is unknown
    poisoned: bool,
}

type OutboundRef = Arc<Mutex<Outbound>>;

/// State shared with the accept and reader tasks
struct ReaderContext {
    max_frame: u32,
    stats: StatsCounters,
    events: SharedSink,
    active: AtomicUsize,
    next_conn: AtomicU64,
}

impl ReaderContext {
    fn framing_error(&self, peer: &str, err: &FramingError) {
        self.stats.framing_error();
        self.events.emit(&TransportEvent::FramingError {
            kind: ConnectorKind::Unix,
            peer: peer.to_string(),
            detail: err.to_string(),
        });
    }
}

/// Unix domain socket connector
pub struct UnixConnector {
    config: UnixConfig,
    path: PathBuf,
    lifecycle: Lifecycle,
    context: Arc<ReaderContext>,
    outbound: DashMap<PathBuf, OutboundRef>,
    inbound: ReceiveSlot,
    shutdown: watch::Sender<bool>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl UnixConnector {
    /// Bind the daemon socket and start accepting peers
    pub async fn open(config: UnixConfig, events: SharedSink) -> Result<Self, ConnectionError> {
        if config.node_name.is_empty() || config.node_name.contains('/') {
            return Err(ConnectionError::InvalidConfig(format!(
                "invalid node name '{}'",
                config.node_name
            )));
        }

        tokio::fs::create_dir_all(&config.socket_dir).await?;
        let path = config.socket_path();
        remove_stale_socket(&path).await?;
        let listener = UnixListener::bind(&path)?;

        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let context = Arc::new(ReaderContext {
            max_frame: config.max_frame_size,
            stats: StatsCounters::default(),
            events: events.clone(),
            active: AtomicUsize::new(0),
            next_conn: AtomicU64::new(0),
        });

        let accept_task = tokio::spawn(accept_loop(listener, tx, shutdown_rx, context.clone()));

        tracing::info!(node = %config.node_name, path = %path.display(), "Unix connector listening");
        events.emit(&TransportEvent::ConnectorOpened {
            kind: ConnectorKind::Unix,
            address: path.display().to_string(),
        });

        Ok(Self {
            config,
            path,
            lifecycle: Lifecycle::new(),
            context,
            outbound: DashMap::new(),
            inbound: ReceiveSlot::new(ReceiverStream::new(rx).boxed()),
            shutdown,
            accept_task: parking_lot::Mutex::new(Some(accept_task)),
        })
    }

    /// Path of this platform's daemon socket
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Other platforms with a daemon socket in the shared directory
    pub async fn peers(&self) -> std::io::Result<Vec<Port>> {
        let mut entries = tokio::fs::read_dir(&self.config.socket_dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path == self.path {
                continue;
            }
            if entry.file_type().await?.is_socket() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths.into_iter().map(Port::Unix).collect())
    }

    /// Cached connection to `path`, or a new one. The flag is set when the
    /// connection was already cached, i.e. may be stale.
    async fn connection(&self, path: &Path) -> Result<(OutboundRef, bool), SendError> {
        if let Some(conn) = self.outbound.get(path) {
            return Ok((conn.value().clone(), true));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            tracing::debug!(path = %path.display(), error = %e, "Connect failed");
            SendError::from_io(&e)
        })?;
        let conn = Arc::new(Mutex::new(Outbound {
            stream,
            poisoned: false,
        }));

        // a concurrent sender may have connected first; theirs wins
        let cached = self
            .outbound
            .entry(path.to_path_buf())
            .or_insert(conn.clone())
            .value()
            .clone();
        let reused = !Arc::ptr_eq(&cached, &conn);
        Ok((cached, reused))
    }

    fn forget(&self, path: &Path, conn: &OutboundRef) {
        self.outbound.remove_if(path, |_, cached| Arc::ptr_eq(cached, conn));
    }

    async fn write_envelope(&self, path: &Path, envelope: &Envelope) -> Result<(), SendError> {
        let body = envelope
            .to_bytes()
            .map_err(|e| SendError::fatal(e.to_string()))?;
        if body.len() > self.config.max_frame_size as usize {
            return Err(SendError::fatal(format!(
                "envelope of {} bytes exceeds frame limit {}",
                body.len(),
                self.config.max_frame_size
            )));
        }

        // a cached connection may outlive its peer (restart); it gets one
        // fresh replacement before the failure counts
        let mut reconnected = false;
        loop {
            let (conn, reused) = self.connection(path).await?;
            let may_reconnect = reused && !reconnected;
            let mut out = conn.lock().await;
            if out.poisoned {
                drop(out);
                self.forget(path, &conn);
                if may_reconnect {
                    reconnected = true;
                    continue;
                }
                return Err(SendError::transient("connection abandoned after failed write"));
            }

            let result = tokio::time::timeout(
                self.config.write_timeout(),
                write_frame(&mut out.stream, &body),
            )
            .await;

            match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    out.poisoned = true;
                    drop(out);
                    self.forget(path, &conn);
                    if may_reconnect && is_stale_connection(&e) {
                        tracing::debug!(path = %path.display(), error = %e, "Cached connection is stale, reconnecting");
                        reconnected = true;
                        continue;
                    }
                    return Err(SendError::from_io(&e));
                }
                Err(_) => {
                    out.poisoned = true;
                    drop(out);
                    self.forget(path, &conn);
                    return Err(SendError::transient(format!(
                        "write to {} timed out after {:?}",
                        path.display(),
                        self.config.write_timeout()
                    )));
                }
            }
        }
    }
}

/// Errors showing the peer went away before this write; nothing was sent
fn is_stale_connection(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected
    )
}

#[async_trait]
impl Connector for UnixConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Unix
    }

    fn local_port(&self) -> Port {
        Port::Unix(self.path.clone())
    }

    fn state(&self) -> ConnectorState {
        self.lifecycle.state()
    }

    async fn send(&self, port: &Port, envelope: &Envelope) -> Result<(), SendError> {
        if self.lifecycle.is_closed() {
            return Err(SendError::fatal("unix connector is closed"));
        }
        let Port::Unix(path) = port else {
            return Err(wrong_port(ConnectorKind::Unix, port));
        };

        let result = self.write_envelope(path, envelope).await;
        match &result {
            Ok(()) => self.context.stats.sent(envelope.payload().len()),
            Err(err) => {
                self.context.stats.send_failed();
                tracing::debug!(path = %path.display(), error = %err, "Unix send failed");
            }
        }
        result
    }

    fn receive(&self) -> Result<InboundStream, TransportError> {
        self.inbound.take()
    }

    async fn close(&self) {
        if !self.lifecycle.close() {
            return;
        }

        self.shutdown.send_replace(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.outbound.clear();

        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove socket");
            }
        }

        self.context.events.emit(&TransportEvent::ConnectorClosed {
            kind: ConnectorKind::Unix,
        });
    }

    fn stats(&self) -> ConnectorStats {
        let active = self.outbound.len() + self.context.active.load(Ordering::Relaxed);
        self.context.stats.snapshot(active)
    }

    /// A platform on this host is reachable at its daemon socket
    async fn discover(&self, platform: &str) -> Option<Port> {
        if platform.is_empty() || platform.contains('/') {
            return None;
        }
        let path = self.config.socket_dir.join(platform);
        if path == self.path {
            return None;
        }
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.file_type().is_socket() => Some(Port::Unix(path)),
            _ => None,
        }
    }
}

impl Drop for UnixConnector {
    fn drop(&mut self) {
        if self.lifecycle.close() {
            self.shutdown.send_replace(true);
            if let Some(task) = self.accept_task.lock().take() {
                task.abort();
            }
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Unlink a socket file left behind by a dead platform.
///
/// A socket that still accepts connections belongs to a live platform and
/// is left alone.
async fn remove_stale_socket(path: &Path) -> Result<(), ConnectionError> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    if UnixStream::connect(path).await.is_ok() {
        return Err(ConnectionError::Unavailable(format!(
            "{} is in use by a running platform",
            path.display()
        )));
    }

    tracing::debug!(path = %path.display(), "Removing stale socket");
    tokio::fs::remove_file(path).await?;
    Ok(())
}

async fn accept_loop(
    listener: UnixListener,
    tx: mpsc::Sender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    context: Arc<ReaderContext>,
) {
    let mut readers = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let id = context.next_conn.fetch_add(1, Ordering::Relaxed);
                    let peer = format!("conn-{id}");
                    tracing::trace!(%peer, "Accepted unix connection");
                    readers.spawn(read_loop(stream, peer, tx.clone(), context.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Unix accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }

    readers.shutdown().await;
}

async fn read_loop(
    mut stream: UnixStream,
    peer: String,
    tx: mpsc::Sender<Envelope>,
    context: Arc<ReaderContext>,
) {
    let _active = ActiveCount::new(&context.active);

    loop {
        match read_frame(&mut stream, context.max_frame).await {
            Ok(Ok(ReadFrame::Frame(body))) => match Envelope::from_bytes(&body) {
                Ok(envelope) => {
                    context.stats.received(envelope.payload().len());
                    if tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::trace!(
                        %peer,
                        head = %hex::encode(&body[..body.len().min(32)]),
                        "Undecodable frame"
                    );
                    context.framing_error(&peer, &err);
                }
            },
            Ok(Ok(ReadFrame::Closed)) => break,
            Ok(Err(err)) => {
                // stream position is lost; only this connection goes
                context.framing_error(&peer, &err);
                break;
            }
            Err(e) => {
                tracing::debug!(%peer, error = %e, "Unix connection read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_frame;
    use crate::observability::MemorySink;
    use tokio::io::AsyncWriteExt;

    async fn open(dir: &Path, name: &str) -> (UnixConnector, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let connector = UnixConnector::open(UnixConfig::new(dir, name), sink.clone())
            .await
            .unwrap();
        (connector, sink)
    }

    fn envelope(seq: u64, payload: &[u8]) -> Envelope {
        Envelope::new("alpha/a".parse().unwrap(), "beta/b".parse().unwrap(), payload.to_vec(), seq)
    }

    #[tokio::test]
    async fn test_send_between_platforms_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (alpha, _) = open(dir.path(), "alpha").await;
        let (beta, _) = open(dir.path(), "beta").await;
        let mut inbound = beta.receive().unwrap();

        for seq in 0..20 {
            alpha
                .send(&beta.local_port(), &envelope(seq, b"ping"))
                .await
                .unwrap();
        }
        for seq in 0..20 {
            let env = inbound.next().await.unwrap();
            assert_eq!(env.sequence(), seq);
            assert_eq!(env.payload(), b"ping");
        }

        assert_eq!(alpha.stats().messages_sent, 20);
        assert_eq!(beta.stats().messages_received, 20);
    }

    #[tokio::test]
    async fn test_missing_socket_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (alpha, _) = open(dir.path(), "alpha").await;
        let port = Port::Unix(dir.path().join("nobody"));

        let err = alpha.send(&port, &envelope(0, b"x")).await.unwrap_err();
        assert!(matches!(err, SendError::Fatal(_)));
        assert_eq!(alpha.stats().send_failures, 1);
    }

    #[tokio::test]
    async fn test_closed_peer_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (alpha, _) = open(dir.path(), "alpha").await;
        let (beta, _) = open(dir.path(), "beta").await;
        let port = beta.local_port();

        alpha.send(&port, &envelope(0, b"first")).await.unwrap();
        beta.close().await;
        assert!(!dir.path().join("beta").exists());

        // the stale connection is retried once; the socket is gone
        let mut failed = None;
        for seq in 1..10 {
            if let Err(err) = alpha.send(&port, &envelope(seq, b"again")).await {
                failed = Some(err);
                break;
            }
        }
        assert!(matches!(failed, Some(SendError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_restarted_peer_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let (alpha, _) = open(dir.path(), "alpha").await;
        let (beta, _) = open(dir.path(), "beta").await;
        let port = beta.local_port();
        let mut inbound = beta.receive().unwrap();

        alpha.send(&port, &envelope(0, b"first")).await.unwrap();
        assert_eq!(inbound.next().await.unwrap().sequence(), 0);
        beta.close().await;
        drop(inbound);
        drop(beta);

        let (beta, _) = open(dir.path(), "beta").await;
        let mut inbound = beta.receive().unwrap();
        alpha
            .send(&port, &envelope(1, b"after restart"))
            .await
            .unwrap();

        let env = inbound.next().await.unwrap();
        assert_eq!(env.sequence(), 1);
        assert_eq!(env.payload(), b"after restart");
        assert_eq!(alpha.stats().send_failures, 0);
    }

    #[test]
    fn test_stale_connection_errors() {
        use std::io::{Error, ErrorKind};
        assert!(is_stale_connection(&Error::from(ErrorKind::BrokenPipe)));
        assert!(is_stale_connection(&Error::from(ErrorKind::ConnectionReset)));
        assert!(!is_stale_connection(&Error::from(ErrorKind::NotFound)));
        assert!(!is_stale_connection(&Error::from(ErrorKind::TimedOut)));
    }

    #[tokio::test]
    async fn test_malformed_frame_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (beta, sink) = open(dir.path(), "beta").await;
        let mut inbound = beta.receive().unwrap();

        let mut raw = UnixStream::connect(beta.socket_path()).await.unwrap();
        raw.write_all(&encode_frame(b"\xFF\xFF not an envelope")).await.unwrap();
        let valid = envelope(7, b"after garbage").to_bytes().unwrap();
        raw.write_all(&encode_frame(&valid)).await.unwrap();

        let env = inbound.next().await.unwrap();
        assert_eq!(env.sequence(), 7);
        assert_eq!(beta.stats().framing_errors, 1);
        assert_eq!(
            sink.matching(|e| matches!(e, TransportEvent::FramingError { .. }))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_only_that_connection() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let config = UnixConfig {
            max_frame_size: 128,
            ..UnixConfig::new(dir.path(), "beta")
        };
        let beta = UnixConnector::open(config, sink.clone()).await.unwrap();
        let (alpha, _) = open(dir.path(), "alpha").await;
        let mut inbound = beta.receive().unwrap();

        let mut raw = UnixStream::connect(beta.socket_path()).await.unwrap();
        raw.write_all(&encode_frame(&[0u8; 512])).await.unwrap();

        alpha
            .send(&beta.local_port(), &envelope(1, b"still works"))
            .await
            .unwrap();
        assert_eq!(inbound.next().await.unwrap().payload(), b"still works");
    }

    #[tokio::test]
    async fn test_stalled_peer_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let stalled = dir.path().join("stalled");
        // accepts nothing and reads nothing
        let _listener = UnixListener::bind(&stalled).unwrap();

        let config = UnixConfig {
            write_timeout_ms: 50,
            ..UnixConfig::new(dir.path(), "alpha")
        };
        let alpha = UnixConnector::open(config, Arc::new(MemorySink::new()))
            .await
            .unwrap();

        let payload = vec![0u8; 256 * 1024];
        let mut transient = false;
        for seq in 0..32 {
            match alpha.send(&Port::Unix(stalled.clone()), &envelope(seq, &payload)).await {
                Ok(()) => continue,
                Err(err) => {
                    transient = err.is_transient();
                    break;
                }
            }
        }
        assert!(transient);
    }

    #[tokio::test]
    async fn test_stale_socket_replaced_and_peers_listed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpha"), b"left over").unwrap();

        let (alpha, _) = open(dir.path(), "alpha").await;
        let (_beta, _) = open(dir.path(), "beta").await;
        let (_gamma, _) = open(dir.path(), "gamma").await;

        let peers = alpha.peers().await.unwrap();
        assert_eq!(
            peers,
            vec![
                Port::Unix(dir.path().join("beta")),
                Port::Unix(dir.path().join("gamma")),
            ]
        );
    }

    #[tokio::test]
    async fn test_discover_platform_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (alpha, _) = open(dir.path(), "alpha").await;
        let (_beta, _) = open(dir.path(), "beta").await;
        std::fs::write(dir.path().join("notes"), b"not a socket").unwrap();

        assert_eq!(
            alpha.discover("beta").await,
            Some(Port::Unix(dir.path().join("beta")))
        );
        assert_eq!(alpha.discover("alpha").await, None);
        assert_eq!(alpha.discover("notes").await, None);
        assert_eq!(alpha.discover("gamma").await, None);
        assert_eq!(alpha.discover("../beta").await, None);
    }

    #[tokio::test]
    async fn test_live_socket_not_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let (_alpha, _) = open(dir.path(), "alpha").await;
        let second =
            UnixConnector::open(UnixConfig::new(dir.path(), "alpha"), Arc::new(MemorySink::new()))
                .await;
        assert!(matches!(second, Err(ConnectionError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_close_ends_receive_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (alpha, sink) = open(dir.path(), "alpha").await;
        let mut inbound = alpha.receive().unwrap();
        assert!(matches!(alpha.receive(), Err(TransportError::AlreadyTaken)));

        alpha.close().await;
        alpha.close().await;
        assert!(inbound.next().await.is_none());
        assert_eq!(alpha.state(), ConnectorState::Closed);
        assert_eq!(
            sink.matching(|e| matches!(e, TransportEvent::ConnectorClosed { .. }))
                .len(),
            1
        );
    }
}
