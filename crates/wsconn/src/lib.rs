//! WebSocket wire adapter.
//!
//! Tunnel sockets arrive as WebSocket connections, but everything above
//! them (line-delimited control traffic, yamux sessions, proxied bytes)
//! wants a plain byte stream. [`WsConn`] runs a read pump and a write pump
//! over the socket and exposes binary frames as `AsyncRead + AsyncWrite`.
//! [`Pinger`] shares the write pump and measures round trips with
//! WebSocket ping/pong frames for liveness probing.

mod conn;
mod pinger;
mod pumps;

pub use conn::WsConn;
pub use pinger::Pinger;

/// Errors reported by the wire adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WsConnError {
    #[error("connection closed")]
    Closed,

    #[error("ping timed out")]
    PingTimeout,
}

/// Outbound frame queue depth.
pub const WRITE_QUEUE_SIZE: usize = 256;

/// Inbound frame queue depth.
pub const READ_QUEUE_SIZE: usize = 64;

/// Largest payload placed in a single binary frame.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;
