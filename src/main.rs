use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatenode::cluster::{Event, EventArgs, Gate, Node, Request};
use gatenode::config::Config;
use gatenode::container::Container;
use gatenode::locate::MemoryLocator;
use gatenode::network::{TcpServer, TcpServerOptions};
use gatenode::registry::MemoryRegistry;
use gatenode::transport::{TcpTransporter, TcpTransporterOptions};

/// Route served by the bundled echo handler.
const ECHO_ROUTE: i32 = 1;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "gatenode starting");

    let config = Config::load()?;
    info!(gid = %config.gate.id, nid = %config.node.id, "Loaded configuration");

    // Single-process cluster: both tiers share in-memory discovery and location.
    let registry = Arc::new(MemoryRegistry::new());
    let locator = Arc::new(MemoryLocator::new());

    let node = Node::builder(config.node.clone())
        .locator(locator.clone())
        .registry(registry.clone())
        .transporter(Arc::new(TcpTransporter::new(TcpTransporterOptions {
            addr: config.node.rpc_address.clone(),
            advertise_host: config.network.advertise_host.clone(),
            ..Default::default()
        })))
        .build()?;

    node.add_route_handler(ECHO_ROUTE, false, |req: Request| async move {
        if let Err(e) = req.respond(req.buffer().clone()).await {
            warn!(cid = req.cid(), error = %e, "Echo reply failed");
        }
    })
    .await;
    node.add_event_listener(Event::Connect, |args: EventArgs| async move {
        info!(gid = %args.gid, cid = args.cid, "Client connected");
    })
    .await;
    node.add_event_listener(Event::Disconnect, |args: EventArgs| async move {
        info!(gid = %args.gid, cid = args.cid, uid = args.uid, "Client disconnected");
    })
    .await;

    let gate = Gate::builder(config.gate.clone())
        .server(Arc::new(TcpServer::new(TcpServerOptions::from(&config.network))))
        .locator(locator)
        .registry(registry)
        .transporter(Arc::new(TcpTransporter::new(TcpTransporterOptions {
            addr: config.gate.rpc_address.clone(),
            advertise_host: config.network.advertise_host.clone(),
            ..Default::default()
        })))
        .build()?;

    let mut container = Container::new();
    container.add(Arc::new(node)).add(Arc::new(gate));
    container.serve().await
}
