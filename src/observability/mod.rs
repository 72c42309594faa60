// observability/mod.rs - Events, Tracing and Metrics

//! Observability for the transport layer.
//!
//! # Features
//!
//! - **Events**: every connector and Router action is reported to an
//!   [`EventSink`]
//! - **Tracing**: structured logging of those events via [`TracingSink`]
//! - **Metrics**: Prometheus counters via [`MetricsSink`]
//!
//! # Example
//!
//! ```ignore
//! use hamas_transport::observability::{init_tracing, FanoutSink, MetricsSink, TracingConfig, TracingSink};
//!
//! init_tracing(&TracingConfig::default())?;
//! let sink = FanoutSink::new()
//!     .with(Arc::new(TracingSink))
//!     .with(Arc::new(MetricsSink));
//! ```

mod events;
mod metrics;
mod tracing_setup;

pub use events::{
    EventSink, FanoutSink, LinkState, MemorySink, SharedSink, TracingSink, TransportEvent,
};

pub use self::metrics::{
    init_metrics, record_send_latency, ConnectorMetrics, MessageMetrics, MetricsConfig,
    MetricsHandle, MetricsSink,
};

pub use tracing_setup::{init_tracing, TracingConfig, TracingFormat};
