// bin/hamas_node.rs - HAMAS Transport Node
//
//! Transport node command line.
//!
//! # Usage
//!
//! ```bash
//! # Serve the configured connectors with an echo agent
//! hamas-node --config node.toml run --route kitchen/heater=platform:10.0.0.7:7700
//!
//! # Send one message and wait for the echo
//! hamas-node --name cellar send --to kitchen/echo --via unix:/tmp/hamas_sockets/kitchen \
//!     --wait-reply "hello"
//!
//! # Print the effective configuration
//! hamas-node config
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use hamas_transport::observability::{FanoutSink, MetricsSink};
use hamas_transport::{
    init_metrics, init_tracing, AgentId, MetricsConfig, PlatformConnector, Port, Router,
    SharedSink, TracingFormat, TracingSink, TransportConfig, UnixConnector,
};

/// HAMAS Transport Node
#[derive(Parser, Debug)]
#[command(name = "hamas-node")]
#[command(version)]
#[command(about = "Message transport node for household agent platforms", long_about = None)]
struct Args {
    /// Config file path (TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the node name
    #[arg(long, global = true)]
    name: Option<String>,

    /// Override the log filter (e.g. "debug,hamas_transport=trace")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the log format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<TracingFormat>,

    /// Serve Prometheus metrics on this address
    #[arg(long, global = true)]
    metrics_addr: Option<std::net::SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the configured connectors and serve an echo agent until Ctrl-C
    Run {
        /// Static route, `<agent>=<port>` (repeatable)
        #[arg(long = "route", value_parser = parse_route)]
        routes: Vec<(AgentId, Port)>,
    },

    /// Send one message
    Send {
        /// Destination agent
        #[arg(long, value_parser = parse_agent)]
        to: AgentId,

        /// Port the destination is reachable on (repeatable). Without one
        /// the destination's platform is discovered.
        #[arg(long = "via", value_parser = parse_port)]
        via: Vec<Port>,

        /// Sending agent, defaults to `<node>/cli`
        #[arg(long, value_parser = parse_agent)]
        from: Option<AgentId>,

        /// Give up after this many milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,

        /// Wait for one reply and print it
        #[arg(long)]
        wait_reply: bool,

        /// Payload, sent as UTF-8
        payload: String,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn parse_agent(s: &str) -> Result<AgentId, String> {
    AgentId::new(s).map_err(|e| e.to_string())
}

fn parse_port(s: &str) -> Result<Port, String> {
    Port::parse(s).map_err(|e| e.to_string())
}

fn parse_route(s: &str) -> Result<(AgentId, Port), String> {
    let (agent, port) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <agent>=<port>, got '{s}'"))?;
    Ok((parse_agent(agent)?, parse_port(port)?))
}

fn load_config(args: &Args) -> Result<TransportConfig> {
    let mut config = TransportConfig::load(args.config.as_deref())?;

    if let Some(name) = &args.name {
        config.node_name = name.clone();
    }
    if let Some(filter) = &args.log_level {
        config.tracing.filter = filter.clone();
    }
    if let Some(format) = args.log_format {
        config.tracing.format = format;
        config.tracing.with_ansi = format != TracingFormat::Json;
    }
    if let Some(addr) = args.metrics_addr {
        config.metrics = Some(MetricsConfig {
            listen_addr: addr,
            ..config.metrics.unwrap_or_default()
        });
    }

    let config = config.normalized();
    config.validate()?;
    Ok(config)
}

fn event_sink(config: &TransportConfig) -> Result<SharedSink> {
    let mut sink = FanoutSink::new().with(Arc::new(TracingSink));

    if let Some(metrics) = &config.metrics {
        let addr = metrics.listen_addr;
        init_metrics(metrics.clone()).map_err(|e| anyhow!("metrics: {e}"))?;
        info!(%addr, "Metrics endpoint enabled");
        sink = sink.with(Arc::new(MetricsSink));
    }
    Ok(Arc::new(sink))
}

/// Open and attach every connector with a configuration section
async fn attach_connectors(config: &TransportConfig, router: &Router, sink: &SharedSink) -> Result<()> {
    if let Some(unix) = &config.unix {
        let connector = UnixConnector::open(unix.clone(), sink.clone())
            .await
            .with_context(|| format!("opening unix socket in {}", unix.socket_dir.display()))?;
        router.attach_connector(Arc::new(connector)).await?;
    }

    if let Some(platform) = &config.platform {
        let connector = PlatformConnector::open(platform.clone(), sink.clone())
            .await
            .with_context(|| format!("listening on {}", platform.listen_addr))?;
        router.attach_connector(Arc::new(connector)).await?;
    }

    if config.zigbee.is_some() {
        warn!("No radio driver is available in this binary; zigbee section ignored");
    }
    Ok(())
}

async fn run(config: TransportConfig, routes: Vec<(AgentId, Port)>) -> Result<()> {
    let sink = event_sink(&config)?;
    let router = Router::new(config.router.clone(), sink.clone());
    attach_connectors(&config, &router, &sink).await?;

    for (agent, port) in routes {
        info!(%agent, %port, "Static route");
        router.register_agent(agent, port);
    }

    let echo = router.attach_agent(AgentId::qualified(&config.node_name, "echo")?)?;
    info!(agent = %echo.id(), node = %config.node_name, "Node running, press Ctrl+C to stop");

    let echo_id = echo.id().clone();
    let replier = router.clone();
    let echo_task = tokio::spawn(async move {
        let mut inbound = echo.into_stream();
        while let Some(envelope) = inbound.next().await {
            info!(
                source = %envelope.source(),
                sequence = envelope.sequence(),
                bytes = envelope.payload().len(),
                "Echo received"
            );
            let source = envelope.source().clone();
            if let Err(err) = replier.send(&echo_id, &source, envelope.into_payload()).await {
                warn!(%source, error = %err, "Echo reply failed");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    router.shutdown().await;
    echo_task.abort();
    info!(stats = ?router.stats(), "Node stopped");
    Ok(())
}

async fn send(
    config: TransportConfig,
    to: AgentId,
    via: Vec<Port>,
    from: Option<AgentId>,
    timeout: Duration,
    wait_reply: bool,
    payload: String,
) -> Result<()> {
    let sink = event_sink(&config)?;
    let router = Router::new(config.router.clone(), sink.clone());
    attach_connectors(&config, &router, &sink).await?;

    for port in via {
        if router.connector(port.kind()).is_none() {
            bail!("{port} needs a {} connector, which is not configured", port.kind());
        }
        router.register_agent(to.clone(), port);
    }

    let from = match from {
        Some(id) => id,
        None => AgentId::qualified(&config.node_name, "cli")?,
    };
    let mut agent = router.attach_agent(from)?;

    let report = agent
        .send_with_timeout(&to, payload.into_bytes(), timeout)
        .await;
    let report = match report {
        Ok(report) => report,
        Err(err) => {
            router.shutdown().await;
            return Err(err.into());
        }
    };
    println!(
        "delivered to {to} via {} (sequence {}, {} attempt(s))",
        report.port, report.sequence, report.attempts
    );

    if wait_reply {
        match tokio::time::timeout(timeout, agent.recv()).await {
            Ok(Some(reply)) => println!(
                "reply from {}: {}",
                reply.source(),
                String::from_utf8_lossy(reply.payload())
            ),
            Ok(None) => println!("mailbox closed before a reply arrived"),
            Err(_) => println!("no reply within {timeout:?}"),
        }
    }

    router.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args)?;

    if matches!(args.command, Command::Config) {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    init_tracing(&config.tracing)?;

    match args.command {
        Command::Run { routes } => run(config, routes).await,
        Command::Send {
            to,
            via,
            from,
            timeout_ms,
            wait_reply,
            payload,
        } => {
            // one-shot sender; must not collide with a running node's endpoints
            config.node_name = format!("{}-cli-{}", config.node_name, std::process::id());
            if let Some(platform) = &mut config.platform {
                platform.listen_addr.set_port(0);
            }
            send(
                config.normalized(),
                to,
                via,
                from,
                Duration::from_millis(timeout_ms),
                wait_reply,
                payload,
            )
            .await
        }
        Command::Config => Ok(()),
    }
}
