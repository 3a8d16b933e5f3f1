//! Tunnel server for the reverse-dial transport.
//!
//! Listens on a TCP port and upgrades three kinds of WebSocket requests:
//! v1 agent control sockets, v2 agent sessions, and v1 pick-up connections
//! answering a `conn-ready`. Everything else is refused before the upgrade.

mod route;
mod server;

pub use server::{ServerConfig, TunnelServer};

use backhaul_dialer::DialError;

/// Errors produced by the tunnel server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Dial(#[from] DialError),
}
