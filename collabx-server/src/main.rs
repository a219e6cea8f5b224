//! CollabX relay server: binds the WebSocket relay and, optionally, the
//! HTTP status endpoints over one shared room registry.

use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;

use collabx_relay::config::DEFAULT_MAX_FRAME_SIZE;
use collabx_relay::{status, RelayConfig, RelayServer, RoomRegistry};

/// Command-line arguments. Every flag can also be set from the environment.
#[derive(Debug, Parser)]
#[command(
    name = "collabx-server",
    version,
    about = "Real-time CRDT update relay",
    long_about = "Real-time CRDT update relay.\n\n\
        Serves two listeners: WebSocket clients connect to --bind at /ws/{doc_id}, \
        while GET / and GET /health are served over plain HTTP on --status-bind. \
        The relay port does not answer plain HTTP requests."
)]
struct Args {
    /// Address for the WebSocket relay (`/ws/{doc_id}`)
    #[arg(long, env = "COLLABX_BIND", default_value = "127.0.0.1:8000")]
    bind: String,

    /// Address for the HTTP status endpoints (`/`, `/health`)
    #[arg(long, env = "COLLABX_STATUS_BIND", default_value = "127.0.0.1:8001")]
    status_bind: String,

    /// Do not serve the status endpoints
    #[arg(long, env = "COLLABX_NO_STATUS")]
    no_status: bool,

    /// Frames buffered per client before senders wait for it to catch up
    #[arg(long, env = "COLLABX_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    /// Seconds between server pings, 0 to disable
    #[arg(long, env = "COLLABX_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Largest accepted frame in bytes
    #[arg(long, env = "COLLABX_MAX_FRAME_SIZE", default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            bind_addr: self.bind,
            status_addr: (!self.no_status).then_some(self.status_bind),
            outbound_capacity: self.outbound_capacity,
            heartbeat_interval_secs: self.heartbeat_secs,
            max_frame_size: self.max_frame_size,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    info!("Starting CollabX relay...");

    let registry = Arc::new(RoomRegistry::new(config.outbound_capacity));
    let status_addr = config.status_addr.clone();
    let server = RelayServer::with_registry(config, registry.clone());
    let listener = server.bind().await?;

    if let Some(addr) = status_addr {
        let status_listener = TcpListener::bind(&addr).await?;
        tokio::spawn(async move {
            if let Err(e) = status::serve(status_listener, registry).await {
                error!("Status endpoint stopped: {e}");
            }
        });
    }

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
