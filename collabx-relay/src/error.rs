use tokio_tungstenite::tungstenite;

/// Errors surfaced by the relay.
///
/// Delivery failures to individual recipients are not errors: the registry
/// evicts the recipient and carries on.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),

    #[error("WebSocket transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("Text frame received on a binary-only connection")]
    UnsupportedFrame,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the error happened before the connection joined a room.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::Handshake(_))
    }
}
