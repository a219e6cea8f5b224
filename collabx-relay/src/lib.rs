//! # collabx-relay — Real-time CRDT update relay
//!
//! Groups WebSocket connections into per-document rooms and fans every
//! binary frame out to the other members of the sender's room. Payloads
//! are opaque: merging happens on the clients, the relay only transports.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐  /ws/{doc_id}   ┌──────────────┐
//!            ├───────────────► │ RelayServer  │  accept loop, one task
//! Client B ──┘                 └──────┬───────┘  per connection
//!                                     │
//!                                     ▼
//!                              ┌──────────────┐
//!                              │ session      │  receive → broadcast,
//!                              │ (per conn)   │  drain outbound queue
//!                              └──────┬───────┘
//!                                     │
//!                                     ▼
//!                              ┌──────────────┐      ┌──────────────┐
//!                              │ RoomRegistry │ ◄─── │ status (HTTP)│
//!                              │ doc → members│      │ /  /health   │
//!                              └──────────────┘      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`registry`] — Room membership and echo-suppressed fan-out
//! - [`session`] — Per-connection lifecycle
//! - [`server`] — WebSocket accept loop
//! - [`status`] — HTTP status and liveness endpoints
//! - [`config`] — Relay configuration
//! - [`error`] — Error types

pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod status;

// Re-exports for convenience
pub use config::RelayConfig;
pub use error::RelayError;
pub use registry::{
    BroadcastReport, ConnectionId, Frame, RegistryCounts, RelayStats, RoomHandle, RoomRegistry,
};
pub use server::RelayServer;
pub use session::{CloseReason, SessionState, SessionSummary};
pub use status::{HealthReport, StatusReport};
