// observability/metrics.rs - Prometheus Metrics

use super::events::{EventSink, TransportEvent};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for metrics
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address to expose metrics endpoint
    pub listen_addr: SocketAddr,

    /// Histogram buckets for send latency (in seconds)
    pub latency_buckets: Vec<f64>,

    /// Histogram buckets for payload sizes (in bytes)
    pub size_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            latency_buckets: vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0,
            ],
            size_buckets: vec![
                16.0, 64.0, 84.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0,
            ],
        }
    }
}

/// Handle to the Prometheus metrics exporter
#[derive(Clone)]
pub struct MetricsHandle {
    handle: PrometheusHandle,
}

impl MetricsHandle {
    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Message-related metrics
pub struct MessageMetrics;

impl MessageMetrics {
    pub const SENT_TOTAL: &'static str = "hamas_messages_sent_total";
    pub const RECEIVED_TOTAL: &'static str = "hamas_messages_received_total";
    pub const SEND_FAILURES_TOTAL: &'static str = "hamas_send_failures_total";
    pub const RETRIES_TOTAL: &'static str = "hamas_retries_total";
    pub const PAYLOAD_BYTES: &'static str = "hamas_payload_bytes";
    pub const SEND_LATENCY_SECONDS: &'static str = "hamas_send_latency_seconds";
}

/// Connector and link metrics
pub struct ConnectorMetrics;

impl ConnectorMetrics {
    pub const OPEN: &'static str = "hamas_connectors_open";
    pub const LINKS_CONNECTED: &'static str = "hamas_links_connected";
    pub const FRAMING_ERRORS_TOTAL: &'static str = "hamas_framing_errors_total";
    pub const REASSEMBLY_EXPIRED_TOTAL: &'static str = "hamas_reassembly_expired_total";
    pub const ROUTING_ERRORS_TOTAL: &'static str = "hamas_routing_errors_total";
}

/// Initialize the metrics system
///
/// Starts an HTTP server on the configured address to expose Prometheus metrics.
/// Returns a handle that can be used to render metrics programmatically.
pub fn init_metrics(config: MetricsConfig) -> Result<MetricsHandle, Box<dyn std::error::Error>> {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(MessageMetrics::SEND_LATENCY_SECONDS.into()),
            &config.latency_buckets,
        )?
        .set_buckets_for_metric(
            Matcher::Full(MessageMetrics::PAYLOAD_BYTES.into()),
            &config.size_buckets,
        )?;

    let handle = builder.install_recorder()?;
    let metrics_handle = MetricsHandle { handle: handle.clone() };

    let listen_addr = config.listen_addr;
    let shared_handle = std::sync::Arc::new(handle);

    tokio::spawn(async move {
        use axum::{http::StatusCode, routing::get, Json, Router};
        use serde::Serialize;

        #[derive(Serialize)]
        struct HealthResponse {
            status: &'static str,
            version: &'static str,
            uptime_secs: u64,
        }

        let start_time = std::time::Instant::now();

        let handle_for_route = shared_handle.clone();
        let app = Router::new()
            .route(
                "/metrics",
                get(move || {
                    let h = handle_for_route.clone();
                    async move { h.render() }
                }),
            )
            .route(
                "/health",
                get(move || {
                    let uptime = start_time.elapsed().as_secs();
                    async move {
                        Json(HealthResponse {
                            status: "healthy",
                            version: env!("CARGO_PKG_VERSION"),
                            uptime_secs: uptime,
                        })
                    }
                }),
            )
            .route("/live", get(|| async { StatusCode::OK }));

        match tokio::net::TcpListener::bind(listen_addr).await {
            Ok(listener) => {
                tracing::info!(addr = %listen_addr, "Metrics HTTP server started");
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "Metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, addr = %listen_addr, "Failed to bind metrics server");
            }
        }
    });

    describe_counter!(MessageMetrics::SENT_TOTAL, "Total number of envelopes sent");
    describe_counter!(
        MessageMetrics::RECEIVED_TOTAL,
        "Total number of envelopes received"
    );
    describe_counter!(
        MessageMetrics::SEND_FAILURES_TOTAL,
        "Total number of failed connector sends"
    );
    describe_counter!(
        MessageMetrics::RETRIES_TOTAL,
        "Total number of send retries after transient failures"
    );
    describe_histogram!(MessageMetrics::PAYLOAD_BYTES, "Payload size in bytes");
    describe_histogram!(
        MessageMetrics::SEND_LATENCY_SECONDS,
        "Time from send call to medium acceptance in seconds"
    );

    describe_gauge!(ConnectorMetrics::OPEN, "Currently open connectors");
    describe_gauge!(
        ConnectorMetrics::LINKS_CONNECTED,
        "Currently connected platform links"
    );
    describe_counter!(
        ConnectorMetrics::FRAMING_ERRORS_TOTAL,
        "Total number of malformed inbound frames"
    );
    describe_counter!(
        ConnectorMetrics::REASSEMBLY_EXPIRED_TOTAL,
        "Total number of incomplete radio messages dropped"
    );
    describe_counter!(
        ConnectorMetrics::ROUTING_ERRORS_TOTAL,
        "Total number of inbound envelopes with no local mailbox"
    );

    tracing::info!(addr = %config.listen_addr, "Metrics initialized");

    Ok(metrics_handle)
}

// Recording functions

/// Record a send latency sample
pub fn record_send_latency(latency: Duration, connector: &str) {
    histogram!(
        MessageMetrics::SEND_LATENCY_SECONDS,
        "connector" => connector.to_string()
    )
    .record(latency.as_secs_f64());
}

/// Event sink that turns transport events into metrics
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn emit(&self, event: &TransportEvent) {
        use super::events::LinkState;

        match event {
            TransportEvent::ConnectorOpened { kind, .. } => {
                gauge!(ConnectorMetrics::OPEN, "connector" => kind.as_str()).increment(1.0);
            }
            TransportEvent::ConnectorClosed { kind } => {
                gauge!(ConnectorMetrics::OPEN, "connector" => kind.as_str()).decrement(1.0);
            }
            TransportEvent::LinkStateChanged { kind, from, to, .. } => {
                if *to == LinkState::Connected {
                    gauge!(ConnectorMetrics::LINKS_CONNECTED, "connector" => kind.as_str())
                        .increment(1.0);
                } else if *from == LinkState::Connected {
                    gauge!(ConnectorMetrics::LINKS_CONNECTED, "connector" => kind.as_str())
                        .decrement(1.0);
                }
            }
            TransportEvent::MessageSent { kind, bytes, .. } => {
                counter!(MessageMetrics::SENT_TOTAL, "connector" => kind.as_str()).increment(1);
                histogram!(MessageMetrics::PAYLOAD_BYTES, "direction" => "out")
                    .record(*bytes as f64);
            }
            TransportEvent::MessageReceived { kind, bytes, .. } => {
                counter!(MessageMetrics::RECEIVED_TOTAL, "connector" => kind.as_str())
                    .increment(1);
                histogram!(MessageMetrics::PAYLOAD_BYTES, "direction" => "in")
                    .record(*bytes as f64);
            }
            TransportEvent::SendFailed { kind, transient, .. } => {
                counter!(
                    MessageMetrics::SEND_FAILURES_TOTAL,
                    "connector" => kind.as_str(),
                    "transient" => transient.to_string()
                )
                .increment(1);
            }
            TransportEvent::Retrying { kind, .. } => {
                counter!(MessageMetrics::RETRIES_TOTAL, "connector" => kind.as_str()).increment(1);
            }
            TransportEvent::RoutingError { .. } => {
                counter!(ConnectorMetrics::ROUTING_ERRORS_TOTAL).increment(1);
            }
            TransportEvent::FramingError { kind, .. } => {
                counter!(ConnectorMetrics::FRAMING_ERRORS_TOTAL, "connector" => kind.as_str())
                    .increment(1);
            }
            TransportEvent::ReassemblyExpired { .. } => {
                counter!(ConnectorMetrics::REASSEMBLY_EXPIRED_TOTAL).increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ConnectorKind;

    #[test]
    fn test_metrics_config_default() {
        let config = MetricsConfig::default();
        assert!(!config.latency_buckets.is_empty());
        assert!(config.size_buckets.contains(&84.0));
    }

    #[test]
    fn test_metric_names() {
        assert!(MessageMetrics::SENT_TOTAL.starts_with("hamas_"));
        assert!(ConnectorMetrics::OPEN.starts_with("hamas_"));
        assert!(ConnectorMetrics::REASSEMBLY_EXPIRED_TOTAL.starts_with("hamas_"));
    }

    #[test]
    fn test_metrics_sink_without_recorder() {
        // No recorder installed: every macro is a no-op
        MetricsSink.emit(&TransportEvent::ConnectorOpened {
            kind: ConnectorKind::Unix,
            address: "/tmp/hamas_sockets/a".into(),
        });
        record_send_latency(Duration::from_millis(3), "unix");
    }
}
