//! fieldnet node binary.
//!
//! Starts one router per configured device, all connected over in-process
//! memory links, optionally sends a test telegram between two of them and
//! prints the router statistics before shutting down.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::Parser;
use fieldnet_link::ProtocolRegistry;
use fieldnet_routing::{Delivery, Osi3Router};
use fieldnet_topology::DeviceAddr;
use fieldnet_wire::Priority;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::FieldnetConfig;
use logging::FieldnetLogFormatter;

/// Library crates whose log level follows `--log-level`
const LOG_TARGETS: [&str; 6] = [
    "fieldnet",
    "fieldnet_wire",
    "fieldnet_topology",
    "fieldnet_link",
    "fieldnet_longtel",
    "fieldnet_routing",
];

/// Telecontrol field-network node
#[derive(Parser, Debug)]
#[command(name = "fieldnet", version, about = "Telecontrol field-network node")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "fieldnet.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Send one telegram from a local device to another, e.g. 1:3
    #[arg(long, value_parser = parse_send)]
    send: Option<SendRequest>,

    /// Size of the test telegram in bytes
    #[arg(long, default_value_t = 16)]
    payload_size: usize,

    /// Send the test telegram as a long telegram
    #[arg(long)]
    long: bool,

    /// Priority class of the test telegram (1 or 2)
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
    priority: u8,

    /// How long to keep the network running, e.g. 2s
    #[arg(long, default_value = "2s")]
    run_for: humantime::Duration,
}

/// Source and destination of the test telegram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SendRequest {
    source: DeviceAddr,
    destination: DeviceAddr,
}

fn parse_send(value: &str) -> Result<SendRequest, String> {
    let (source, destination) = value
        .split_once(':')
        .ok_or_else(|| format!("expected <src>:<dst>, got {:?}", value))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<u8>()
            .map(DeviceAddr)
            .map_err(|e| format!("invalid device address {:?}: {}", s, e))
    };
    Ok(SendRequest {
        source: parse(source)?,
        destination: parse(destination)?,
    })
}

/// Recognisable test payload; no zero bytes, so short telegrams are never
/// mistaken for long-telegram fragments
fn test_payload(len: usize) -> Bytes {
    (0..len)
        .map(|i| (i % 255) as u8 + 1)
        .collect::<Vec<u8>>()
        .into()
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    for target in LOG_TARGETS {
        env_filter = env_filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .event_format(FieldnetLogFormatter::new("fieldnet".to_string()))
        .init();

    info!("Starting fieldnet v{}", env!("CARGO_PKG_VERSION"));

    let config = FieldnetConfig::load_from_file(&args.config)?;
    if config.nodes.is_empty() {
        bail!("No nodes configured in {:?}", args.config);
    }
    let router_config = config.router_config()?;
    let registry = ProtocolRegistry::with_builtin();

    let mut routers: Vec<Arc<Osi3Router>> = Vec::with_capacity(config.nodes.len());
    for &node in &config.nodes {
        let router = Osi3Router::start(node, &config.topology, router_config.clone(), &registry)
            .await
            .with_context(|| format!("Failed to start router for device {}", node))?;

        let (tx, rx) = mpsc::unbounded_channel();
        router.add_listener(Arc::new(tx));
        tokio::spawn(report_deliveries(node, rx));
        routers.push(Arc::new(router));
    }
    info!("{} nodes running", routers.len());

    if let Some(request) = args.send {
        let router = routers
            .iter()
            .find(|r| r.local() == request.source)
            .with_context(|| format!("Device {} is not run by this process", request.source))?;
        let priority = Priority::try_from(args.priority)?;
        let payload = test_payload(args.payload_size);

        match router
            .send(request.destination, priority, payload, args.long)
            .await
        {
            Ok(()) => info!(
                "Sent {} bytes from {} to {} (class {}, long: {})",
                args.payload_size,
                request.source,
                request.destination,
                priority.class(),
                args.long
            ),
            Err(e) => warn!(
                "Sending from {} to {} failed: {}",
                request.source, request.destination, e
            ),
        }
    }

    let run_for = Duration::from(args.run_for);
    tokio::select! {
        _ = tokio::time::sleep(run_for) => {
            info!("Run time of {} elapsed", args.run_for);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
    }

    for router in &routers {
        let stats = router.stats().await;
        let rendered = serde_yaml::to_string(&stats).context("Failed to render statistics")?;
        println!("# device {}\n{}", router.local(), rendered);
    }

    for router in &routers {
        router.shutdown().await;
    }
    info!("fieldnet shutdown complete");
    Ok(())
}

/// Log everything the listeners of one node receive
async fn report_deliveries(node: DeviceAddr, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Telegram {
                sender,
                payload,
                is_long,
            } => crate::component_info!(
                "app",
                "Device {} received {} bytes from {} (long: {})",
                node,
                payload.len(),
                sender,
                is_long
            ),
            Delivery::LinkState { device, connected } if connected => {
                crate::component_info!("app", "Device {}: link to {} up", node, device)
            }
            Delivery::LinkState { device, .. } => {
                crate::component_warn!("app", "Device {}: link to {} down", node, device)
            }
        }
    }
}
