//! WebSocket relay server.
//!
//! Accepts TCP connections and runs each one as its own task. A small
//! supervisor task awaits every connection task so that errors and panics
//! are logged at the connection boundary instead of reaching the accept
//! loop or other connections.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::registry::RoomRegistry;
use crate::session::handle_connection;

/// The relay server.
pub struct RelayServer {
    config: Arc<RelayConfig>,
    registry: Arc<RoomRegistry>,
}

impl RelayServer {
    /// Create a server with its own registry.
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.outbound_capacity));
        Self::with_registry(config, registry)
    }

    /// Create a server sharing an existing registry.
    pub fn with_registry(config: RelayConfig, registry: Arc<RoomRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            registry,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured relay address.
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        Ok(listener)
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");
            self.spawn_connection(stream, addr);
        }
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let connection = tokio::spawn(handle_connection(
            stream,
            addr,
            self.registry.clone(),
            self.config.clone(),
        ));

        tokio::spawn(async move {
            match connection.await {
                Ok(Ok(summary)) => log::debug!(
                    "Session {} for '{}' closed ({:?}): {} frames in, {} frames out",
                    summary.connection_id,
                    summary.doc_id,
                    summary.close_reason,
                    summary.frames_received,
                    summary.frames_sent
                ),
                Ok(Err(e)) if e.is_handshake() => {
                    log::warn!("Handshake with {addr} failed: {e}");
                }
                // Already logged by the session.
                Ok(Err(_)) => {}
                Err(e) if e.is_panic() => {
                    log::error!("Connection task for {addr} panicked");
                }
                Err(e) => log::debug!("Connection task for {addr} cancelled: {e}"),
            }
        });
    }

    /// Shared registry, for wiring the status surface.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
