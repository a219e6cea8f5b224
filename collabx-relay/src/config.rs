//! Relay configuration.

use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Default upper bound on a single inbound message (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 << 20;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the WebSocket relay binds to
    pub bind_addr: String,
    /// Address the HTTP status surface binds to (None = disabled)
    pub status_addr: Option<String>,
    /// Frames buffered per connection before broadcasters to it wait
    pub outbound_capacity: usize,
    /// Server ping interval in seconds (0 = disabled)
    pub heartbeat_interval_secs: u64,
    /// Largest inbound frame or message accepted, in bytes
    pub max_frame_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            status_addr: Some("127.0.0.1:8001".to_string()),
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl RelayConfig {
    /// Heartbeat period, if enabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    /// Transport limits applied to every accepted connection.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_frame_size(Some(self.max_frame_size))
            .max_message_size(Some(self.max_frame_size))
    }
}
