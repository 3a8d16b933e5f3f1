//! Error types for the v1 transport.

use backhaul_protocol::ProtocolError;
use tokio_util::codec::LinesCodecError;

#[derive(Debug, thiserror::Error)]
pub enum RevdialError {
    #[error("dial cancelled")]
    Cancelled,

    #[error("dialer closed")]
    DialerClosed,

    #[error("listener closed")]
    ListenerClosed,

    #[error("pick-up failed: {0}")]
    PickupFailed(String),

    #[error("unknown dialer: {0}")]
    UnknownDialer(String),

    #[error("bad pick-up query: {0}")]
    BadPickupQuery(String),

    #[error("timed out")]
    Timeout,

    #[error("pick-up answered with HTTP {0}, expected 101")]
    BadStatus(u16),

    #[error("control stream: {0}")]
    Lines(#[from] LinesCodecError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
