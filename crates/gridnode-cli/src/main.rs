//! # Gridnode Agent Entry Point
//!
//! Starts the per-host compute node agent: the message router, the session
//! manager's control channel to it, the HTTP surface and the event pipeline,
//! then registers the node with the Coordinator and runs until asked to
//! shut down.
//!
//! ## Usage
//!
//! ```bash
//! # Start an agent against a local coordinator
//! gridnode --coordinator http://127.0.0.1:8087
//!
//! # Fixed node id and HTTP port
//! gridnode --coordinator http://coord:8087 --node-id <uuid> --http-port 8090
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use argh::FromArgs;
use uuid::Uuid;

use gridnode_agent::events::{CoordinatorClient, EventPipeline};
use gridnode_agent::http::HttpService;
use gridnode_agent::node::{raise_fd_limit, Agent};
use gridnode_agent::{ComputationDefaults, RouterLink, SessionManager};
use gridnode_router::{Router, RouterConfig};

/// How long to wait for queued events to reach the Coordinator at shutdown.
const DRAIN_EVENTS_TIMEOUT: Duration = Duration::from_secs(1);

/// gridnode - compute farm node agent
#[derive(FromArgs)]
struct Options {
    /// base URL of the Coordinator (e.g. http://127.0.0.1:8087)
    #[argh(option)]
    coordinator: String,

    /// node id; a random UUID is generated when omitted
    #[argh(option)]
    node_id: Option<String>,

    /// HTTP port for the REST surface; 0 selects an ephemeral port
    #[argh(option, default = "0")]
    http_port: u16,

    /// directory for the router IPC socket; defaults to the temp directory
    #[argh(option)]
    ipc_dir: Option<PathBuf>,

    /// directory for per-computation config documents; defaults to the temp
    /// directory
    #[argh(option)]
    tmp_dir: Option<PathBuf>,

    /// seconds an entry-node session waits for its client before expiring
    #[argh(option, default = "30")]
    client_connection_timeout: u64,

    /// suspend computations at "go" with SIGSTOP (debugging aid)
    #[argh(switch)]
    auto_suspend: bool,

    /// skip Coordinator registration (for local testing)
    #[argh(switch)]
    no_register: bool,

    /// disable the request-flood ban list
    #[argh(switch)]
    disable_banlist: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let options: Options = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let node_id = match &options.node_id {
        Some(raw) => Uuid::parse_str(raw)
            .map_err(|_| anyhow!("node-id argument is invalid: {raw}"))?,
        None => Uuid::new_v4(),
    };
    tracing::info!("initializing node id {}", node_id);

    if let Err(err) = raise_fd_limit() {
        tracing::warn!("could not raise file descriptor limit: {err}");
    }

    let tmp_dir = options.tmp_dir.clone().unwrap_or_else(std::env::temp_dir);
    let ipc_dir = options.ipc_dir.clone().unwrap_or_else(std::env::temp_dir);
    let ipc_path = ipc_dir.join(format!("gridnodeipc-{node_id}"));

    let defaults = ComputationDefaults {
        auto_suspend: options.auto_suspend,
        ipc_path: ipc_path.clone(),
        tmp_dir,
        client_connection_timeout_secs: options.client_connection_timeout,
        ..ComputationDefaults::default()
    };

    // the router binds its sockets first; everything else talks through it
    let router = Router::start(RouterConfig::new(node_id, &ipc_path))
        .await
        .context("cannot start node router")?;

    let link = RouterLink::connect_with_retries(node_id, &ipc_path)
        .await
        .context("cannot connect to node router")?;
    let router_port = link
        .wait_for_router_port()
        .await
        .context("did not receive message port number from router within timeout")?;
    tracing::info!("router message port is {}", router_port);

    let agent = Agent::new(node_id, defaults.clone());
    let coordinator = CoordinatorClient::new(options.coordinator.clone());
    let (events, pipeline) = EventPipeline::new(
        CoordinatorClient::new(options.coordinator.clone()),
        agent.stop_sender(),
    );
    pipeline.spawn();

    let manager = SessionManager::new(node_id, defaults, link.clone(), events.clone());
    link.attach(&manager, events.clone());

    let bind: SocketAddr = ([0, 0, 0, 0], options.http_port).into();
    let http = HttpService::start(
        agent.clone(),
        manager.clone(),
        bind,
        !options.disable_banlist,
    )
    .await
    .context("cannot start HTTP service")?;

    let hostname = hostname();
    let node_info = agent.build_node_info(http.port(), router_port, &hostname, &host_ip());
    if !options.no_register {
        coordinator
            .register_node(&node_info)
            .await
            .context("node registration failed")?;
        agent.set_registered(true);
    }

    tracing::info!("node agent running");
    run_until_stopped(&agent).await;

    // orderly shutdown: sessions first, then drain events, then deregister
    tracing::debug!("shutting down node");
    link.set_exiting();
    manager.shutdown_all("node exiting").await;
    events.drain(DRAIN_EVENTS_TIMEOUT).await;
    if agent.is_registered() {
        if let Err(err) = coordinator.deregister_node(node_id).await {
            tracing::error!("failure while deregistering node: {err}");
        }
        agent.set_registered(false);
    }
    http.shutdown();
    router.shutdown();

    Ok(())
}

async fn run_until_stopped(agent: &Arc<Agent>) {
    let mut stop = agent.stop_watch();
    tokio::select! {
        _ = stop.wait_for(|s| *s) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                tracing::error!("cannot listen for shutdown signal: {err}");
            }
            tracing::info!("shutdown signal received");
        }
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Best-effort local address for the node info document; the Coordinator
/// sees the real peer address anyway.
fn host_ip() -> String {
    use std::net::UdpSocket;
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|sock| {
            sock.connect("8.8.8.8:80")?;
            sock.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
