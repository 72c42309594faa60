// router.rs - Transport Router
//
//! The Router maps agent identities to connectors and moves envelopes
//! between them.
//!
//! # Outbound
//!
//! [`Router::send`] resolves the destination's ports in priority order
//! (default `Local > Unix > Platform > ZigBee`), retries transient failures
//! on one medium with exponential backoff and falls back to the next port
//! once a medium is exhausted. When no port is left, the last failure is
//! returned as [`TransportError::Fatal`].
//!
//! A destination without a registered route is looked up through the
//! connectors' discovered platforms, in priority order; every port found
//! becomes a route. Connectors announce themselves and refresh their peers
//! every `discovery_interval_ms`.
//!
//! # Inbound
//!
//! Every attached connector gets a forwarding task that moves its receive
//! stream into one bounded inbound queue. A single dispatcher drains the
//! queue into local agent mailboxes. Envelopes for unknown agents are
//! dropped and reported as routing errors.
//!
//! # Example
//!
//! ```no_run
//! use hamas_transport::observability::TracingSink;
//! use hamas_transport::router::{Router, RouterConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> hamas_transport::error::Result<()> {
//! let router = Router::new(RouterConfig::default(), Arc::new(TracingSink));
//! let heater = router.attach_agent("heater".parse()?)?;
//! let mut meter = router.attach_agent("meter".parse()?)?;
//!
//! heater.send(&"meter".parse()?, b"kw?".to_vec()).await?;
//! let envelope = meter.recv().await;
//! # Ok(())
//! # }
//! ```

use crate::address::{AgentAddress, AgentId, ConnectorKind, Port};
use crate::connector::{Connector, ConnectorStats, InboundStream, LocalConnector, Mailboxes};
use crate::envelope::Envelope;
use crate::error::{Result, SendError, TransportError};
use crate::observability::{record_send_latency, SharedSink, TransportEvent};
use crate::retry::RetryPolicy;
use crate::routing::RoutingTable;
use dashmap::DashMap;
use futures::stream::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Connector preference, most preferred first
    pub priority: Vec<ConnectorKind>,

    /// Retry policy for transient failures on one medium
    pub retry: RetryPolicy,

    /// Inbound envelopes buffered between connectors and the dispatcher
    pub inbound_capacity: usize,

    /// Period of connector announcements and peer refreshes, 0 disables
    pub discovery_interval_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            priority: ConnectorKind::ALL.to_vec(),
            retry: RetryPolicy::default(),
            inbound_capacity: 1024,
            discovery_interval_ms: 30_000,
        }
    }
}

/// Membership change reported by the agent registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// An agent became reachable on the given ports
    Joined(AgentAddress),
    /// An agent went away entirely
    Left(AgentId),
}

/// Outcome of a successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Sequence number stamped on the envelope
    pub sequence: u64,

    /// Medium that accepted the envelope
    pub connector: ConnectorKind,

    /// Port the envelope went to
    pub port: Port,

    /// Attempts on the accepting medium, including the successful one
    pub attempts: u32,
}

/// Router statistics
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    /// Envelopes accepted by a connector
    pub messages_sent: u64,

    /// Envelopes delivered to local mailboxes
    pub messages_dispatched: u64,

    /// Sends that failed on every port
    pub send_failures: u64,

    /// Retries after transient failures
    pub retries: u64,

    /// Inbound envelopes with no local recipient
    pub routing_errors: u64,

    /// Agents with at least one port
    pub known_agents: usize,

    /// Agents attached to this Router
    pub local_agents: usize,

    /// Per connector statistics
    pub connectors: BTreeMap<ConnectorKind, ConnectorStats>,
}

#[derive(Debug, Default)]
struct RouterCounters {
    messages_sent: AtomicU64,
    messages_dispatched: AtomicU64,
    send_failures: AtomicU64,
    retries: AtomicU64,
    routing_errors: AtomicU64,
}

struct RouterInner {
    config: RouterConfig,
    routes: RwLock<RoutingTable>,
    connectors: RwLock<HashMap<ConnectorKind, Arc<dyn Connector>>>,
    forwarders: Mutex<HashMap<ConnectorKind, JoinHandle<()>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    discovery: Mutex<Option<JoinHandle<()>>>,
    mailboxes: Mailboxes,
    sequences: Mutex<HashMap<(AgentId, AgentId), u64>>,
    inbound: mpsc::Sender<(ConnectorKind, Envelope)>,
    events: SharedSink,
    counters: Arc<RouterCounters>,
    shut_down: AtomicBool,
}

impl RouterInner {
    fn next_sequence(&self, source: &AgentId, destination: &AgentId) -> u64 {
        let mut sequences = self.sequences.lock();
        let next = sequences
            .entry((source.clone(), destination.clone()))
            .or_insert(0);
        let sequence = *next;
        *next += 1;
        sequence
    }

    /// Drop the sequence counters of every pair involving `id`
    fn forget_sequences(&self, id: &AgentId) {
        self.sequences
            .lock()
            .retain(|(source, destination), _| source != id && destination != id);
    }

    fn connector(&self, kind: ConnectorKind) -> Option<Arc<dyn Connector>> {
        self.connectors.read().get(&kind).cloned()
    }

    /// Attached connectors in priority order
    fn prioritized(&self) -> Vec<Arc<dyn Connector>> {
        let connectors = self.connectors.read();
        self.config
            .priority
            .iter()
            .filter_map(|kind| connectors.get(kind).cloned())
            .collect()
    }

    /// Register a connector and start forwarding its inbound stream
    fn install(&self, connector: Arc<dyn Connector>, stream: InboundStream) {
        let kind = connector.kind();
        let forwarder = tokio::spawn(forward(kind, stream, self.inbound.clone()));
        self.connectors.write().insert(kind, connector);
        if let Some(previous) = self.forwarders.lock().insert(kind, forwarder) {
            previous.abort();
        }
    }
}

/// Move one connector's inbound envelopes into the shared queue
async fn forward(
    kind: ConnectorKind,
    mut stream: InboundStream,
    inbound: mpsc::Sender<(ConnectorKind, Envelope)>,
) {
    while let Some(envelope) = stream.next().await {
        if inbound.send((kind, envelope)).await.is_err() {
            break;
        }
    }
    tracing::debug!(connector = %kind, "Inbound forwarding stopped");
}

/// Let every connector announce itself and refresh its peers, until the
/// Router is gone
async fn refresh_peers(inner: Weak<RouterInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let connectors = match inner.upgrade() {
            Some(inner) => inner.prioritized(),
            None => break,
        };
        for connector in connectors {
            connector.refresh().await;
        }
    }
}

/// Deliver inbound envelopes to local mailboxes
async fn dispatch(
    mut inbound: mpsc::Receiver<(ConnectorKind, Envelope)>,
    mailboxes: Mailboxes,
    events: SharedSink,
    counters: Arc<RouterCounters>,
) {
    while let Some((kind, envelope)) = inbound.recv().await {
        let destination = envelope.destination().clone();
        let event = TransportEvent::MessageReceived {
            kind,
            source: envelope.source().clone(),
            destination: destination.clone(),
            sequence: envelope.sequence(),
            bytes: envelope.payload().len(),
        };

        let delivered = match mailboxes.get(&destination) {
            Some(mailbox) => mailbox.send(envelope).is_ok(),
            None => false,
        };

        if delivered {
            counters.messages_dispatched.fetch_add(1, Ordering::Relaxed);
            events.emit(&event);
        } else {
            counters.routing_errors.fetch_add(1, Ordering::Relaxed);
            events.emit(&TransportEvent::RoutingError {
                destination,
                reason: format!("no local mailbox (via {kind})"),
            });
        }
    }
}

/// Transport manager for one platform
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Create a Router with its LocalConnector attached.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: RouterConfig, events: SharedSink) -> Self {
        let (inbound, rx) = mpsc::channel(config.inbound_capacity.max(1));
        let mailboxes: Mailboxes = Arc::new(DashMap::new());
        let counters = Arc::new(RouterCounters::default());

        let dispatcher = tokio::spawn(dispatch(
            rx,
            mailboxes.clone(),
            events.clone(),
            counters.clone(),
        ));

        let inner = Arc::new(RouterInner {
            config,
            routes: RwLock::new(RoutingTable::new()),
            connectors: RwLock::new(HashMap::new()),
            forwarders: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(Some(dispatcher)),
            discovery: Mutex::new(None),
            mailboxes: mailboxes.clone(),
            sequences: Mutex::new(HashMap::new()),
            inbound,
            events: events.clone(),
            counters,
            shut_down: AtomicBool::new(false),
        });

        let local = LocalConnector::open(mailboxes, events);
        match local.receive() {
            Ok(stream) => inner.install(Arc::new(local), stream),
            Err(err) => tracing::error!(error = %err, "Local connector unavailable"),
        }

        if inner.config.discovery_interval_ms > 0 {
            let period = Duration::from_millis(inner.config.discovery_interval_ms);
            let refresher = tokio::spawn(refresh_peers(Arc::downgrade(&inner), period));
            *inner.discovery.lock() = Some(refresher);
        }

        Self { inner }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    // ---------------------------------------------------------------------
    // Connectors
    // ---------------------------------------------------------------------

    /// Attach a connector, replacing (and closing) one of the same kind
    pub async fn attach_connector(&self, connector: Arc<dyn Connector>) -> Result<()> {
        if self.is_shut_down() {
            return Err(TransportError::Fatal("router is shut down".into()));
        }
        if connector.state() == crate::connector::ConnectorState::Closed {
            return Err(TransportError::Fatal(format!(
                "{} connector is closed",
                connector.kind()
            )));
        }

        let stream = connector.receive()?;
        let kind = connector.kind();
        self.close_connector(kind).await;
        self.inner.install(connector.clone(), stream);
        connector.refresh().await;

        tracing::info!(connector = %kind, port = %connector.local_port(), "Connector attached");
        Ok(())
    }

    /// Close a connector and drop every route through it.
    ///
    /// Returns `false` if no connector of that kind was attached.
    pub async fn close_connector(&self, kind: ConnectorKind) -> bool {
        let Some(connector) = self.inner.connectors.write().remove(&kind) else {
            return false;
        };

        let pruned = self.inner.routes.write().prune_kind(kind);
        connector.close().await;
        if let Some(forwarder) = self.inner.forwarders.lock().remove(&kind) {
            forwarder.abort();
        }

        tracing::info!(connector = %kind, pruned, "Connector closed");
        true
    }

    /// Attached connector of a kind
    pub fn connector(&self, kind: ConnectorKind) -> Option<Arc<dyn Connector>> {
        self.inner.connector(kind)
    }

    // ---------------------------------------------------------------------
    // Routes
    // ---------------------------------------------------------------------

    /// Make an agent reachable on a port. Idempotent.
    pub fn register_agent(&self, id: AgentId, port: Port) -> bool {
        let added = self.inner.routes.write().insert(id.clone(), port.clone());
        if added {
            tracing::debug!(agent = %id, %port, "Route registered");
        }
        added
    }

    /// Remove an agent's port of one kind. With no port left the agent is
    /// unreachable.
    pub fn deregister_agent(&self, id: &AgentId, kind: ConnectorKind) -> Vec<Port> {
        let removed = self.inner.routes.write().remove_kind(id, kind);
        if !removed.is_empty() {
            tracing::debug!(agent = %id, connector = %kind, "Route removed");
        }
        removed
    }

    pub fn on_agent_joined(&self, address: AgentAddress) {
        tracing::debug!(agent = %address.id, ports = address.ports.len(), "Agent joined");
        let mut routes = self.inner.routes.write();
        for port in address.ports {
            routes.insert(address.id.clone(), port);
        }
    }

    /// Forget a remote agent. An agent attached here keeps its local route
    /// for as long as its mailbox exists.
    pub fn on_agent_left(&self, id: &AgentId) {
        // checked under the routes lock so a concurrent detach removes
        // the re-inserted local route after us
        let (removed, attached) = {
            let mut routes = self.inner.routes.write();
            let removed = routes.remove_agent(id);
            let attached = self.inner.mailboxes.contains_key(id);
            if attached {
                routes.insert(id.clone(), Port::Local(id.clone()));
            }
            (removed, attached)
        };
        if !attached {
            self.inner.forget_sequences(id);
        }
        if removed.is_some() {
            tracing::debug!(agent = %id, attached, "Agent left");
        }
    }

    pub fn apply(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Joined(address) => self.on_agent_joined(address),
            RegistryEvent::Left(id) => self.on_agent_left(&id),
        }
    }

    /// Apply registry events from a channel until it closes or the Router
    /// shuts down
    pub fn spawn_registry_listener(&self, mut events: mpsc::Receiver<RegistryEvent>) {
        let router = self.clone();
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                router.apply(event);
            }
        });
        self.inner.listeners.lock().push(listener);
    }

    /// Ports of an agent in priority order
    pub fn resolve(&self, id: &AgentId) -> Vec<Port> {
        self.inner
            .routes
            .read()
            .resolve(id, &self.inner.config.priority)
    }

    // ---------------------------------------------------------------------
    // Local agents
    // ---------------------------------------------------------------------

    /// Create a mailbox for an agent and make it reachable locally
    pub fn attach_agent(&self, id: AgentId) -> Result<AgentHandle> {
        if self.is_shut_down() {
            return Err(TransportError::Fatal("router is shut down".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.mailboxes.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::DuplicateAgent(id));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }
        self.register_agent(id.clone(), Port::Local(id.clone()));

        tracing::info!(agent = %id, "Agent attached");
        Ok(AgentHandle {
            id,
            router: self.clone(),
            inbox: rx,
        })
    }

    /// Remove an agent's mailbox and local route. Its handle stops
    /// receiving once buffered envelopes are drained.
    pub fn detach_agent(&self, id: &AgentId) -> bool {
        let removed = self.inner.mailboxes.remove(id).is_some();
        self.deregister_agent(id, ConnectorKind::Local);
        self.inner.forget_sequences(id);
        if removed {
            tracing::info!(agent = %id, "Agent detached");
        }
        removed
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    /// Send a payload from `source` to `destination`
    pub async fn send(
        &self,
        source: &AgentId,
        destination: &AgentId,
        payload: Vec<u8>,
    ) -> Result<DeliveryReport> {
        if self.is_shut_down() {
            return Err(TransportError::Fatal("router is shut down".into()));
        }

        let mut ports = self.resolve(destination);
        if ports.is_empty() {
            ports = self.discover(destination).await;
        }
        if ports.is_empty() {
            self.inner.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::Unreachable(destination.clone()));
        }

        let sequence = self.inner.next_sequence(source, destination);
        let envelope = Envelope::new(source.clone(), destination.clone(), payload, sequence);
        let mut last_failure = None;

        for port in ports {
            let kind = port.kind();
            let Some(connector) = self.inner.connector(kind) else {
                last_failure = Some(format!("{kind} connector is not attached"));
                continue;
            };

            let started = Instant::now();
            match self.deliver(connector.as_ref(), &port, &envelope).await {
                Ok(attempts) => {
                    record_send_latency(started.elapsed(), kind.as_str());
                    self.inner.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                    self.inner.events.emit(&TransportEvent::MessageSent {
                        kind,
                        source: source.clone(),
                        destination: destination.clone(),
                        sequence,
                        bytes: envelope.payload().len(),
                        attempts,
                    });
                    return Ok(DeliveryReport {
                        sequence,
                        connector: kind,
                        port,
                        attempts,
                    });
                }
                Err(err) => {
                    self.inner.events.emit(&TransportEvent::SendFailed {
                        kind,
                        destination: destination.clone(),
                        transient: err.is_transient(),
                        reason: err.to_string(),
                    });
                    last_failure = Some(err.to_string());
                }
            }
        }

        self.inner.counters.send_failures.fetch_add(1, Ordering::Relaxed);
        Err(TransportError::Fatal(last_failure.unwrap_or_else(|| {
            format!("no usable port for {destination}")
        })))
    }

    /// Ask the connectors, in priority order, for the platform of
    /// `destination`. Every port found becomes a route.
    async fn discover(&self, destination: &AgentId) -> Vec<Port> {
        let Some(platform) = destination.platform() else {
            return Vec::new();
        };

        let mut found = false;
        for connector in self.inner.prioritized() {
            if let Some(port) = connector.discover(platform).await {
                tracing::debug!(agent = %destination, %port, "Route discovered");
                self.inner.routes.write().insert(destination.clone(), port);
                found = true;
            }
        }
        if found {
            self.resolve(destination)
        } else {
            Vec::new()
        }
    }

    /// Send with a deadline. A send cut short reports
    /// [`TransportError::Timeout`] and is not retried.
    pub async fn send_with_timeout(
        &self,
        source: &AgentId,
        destination: &AgentId,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<DeliveryReport> {
        match tokio::time::timeout(timeout, self.send(source, destination, payload)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(%source, %destination, ?timeout, "Send timed out");
                self.inner.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    /// Send on one medium, retrying transient failures.
    /// Returns the number of attempts used.
    async fn deliver(
        &self,
        connector: &dyn Connector,
        port: &Port,
        envelope: &Envelope,
    ) -> std::result::Result<u32, SendError> {
        let retry = &self.inner.config.retry;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match connector.send(port, envelope).await {
                Ok(()) => return Ok(attempts),
                Err(err) if err.is_transient() && retry.allows_retry(attempts) => {
                    let delay = retry.backoff(attempts - 1);
                    self.inner.counters.retries.fetch_add(1, Ordering::Relaxed);
                    self.inner.events.emit(&TransportEvent::Retrying {
                        kind: connector.kind(),
                        destination: envelope.destination().clone(),
                        attempt: attempts,
                        delay,
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Close every connector, drop all routes and mailboxes and stop the
    /// background tasks. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let kinds: Vec<ConnectorKind> = self.inner.connectors.read().keys().copied().collect();
        for kind in kinds {
            self.close_connector(kind).await;
        }

        for listener in self.inner.listeners.lock().drain(..) {
            listener.abort();
        }
        if let Some(dispatcher) = self.inner.dispatcher.lock().take() {
            dispatcher.abort();
        }
        if let Some(refresher) = self.inner.discovery.lock().take() {
            refresher.abort();
        }

        *self.inner.routes.write() = RoutingTable::new();
        self.inner.mailboxes.clear();
        tracing::info!("Router shut down");
    }

    pub fn stats(&self) -> RouterStats {
        let counters = &self.inner.counters;
        RouterStats {
            messages_sent: counters.messages_sent.load(Ordering::Relaxed),
            messages_dispatched: counters.messages_dispatched.load(Ordering::Relaxed),
            send_failures: counters.send_failures.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            routing_errors: counters.routing_errors.load(Ordering::Relaxed),
            known_agents: self.inner.routes.read().len(),
            local_agents: self.inner.mailboxes.len(),
            connectors: self
                .inner
                .connectors
                .read()
                .iter()
                .map(|(kind, connector)| (*kind, connector.stats()))
                .collect(),
        }
    }
}

/// An agent's view of the transport
pub struct AgentHandle {
    id: AgentId,
    router: Router,
    inbox: mpsc::UnboundedReceiver<Envelope>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle").field("id", &self.id).finish()
    }
}

impl AgentHandle {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub async fn send(&self, destination: &AgentId, payload: Vec<u8>) -> Result<DeliveryReport> {
        self.router.send(&self.id, destination, payload).await
    }

    pub async fn send_with_timeout(
        &self,
        destination: &AgentId,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<DeliveryReport> {
        self.router
            .send_with_timeout(&self.id, destination, payload, timeout)
            .await
    }

    /// Next inbound envelope; `None` once the agent is detached and drained
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbox.recv().await
    }

    /// Lazy stream of inbound envelopes
    pub fn into_stream(self) -> impl Stream<Item = Envelope> + Send + 'static {
        UnboundedReceiverStream::new(self.inbox)
    }

    /// Lazy stream of inbound payloads
    pub fn into_payloads(self) -> impl Stream<Item = Vec<u8>> + Send + 'static {
        self.into_stream().map(Envelope::into_payload)
    }
}
