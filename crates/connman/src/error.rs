use backhaul_protocol::{DeviceKey, ProtocolError};
use backhaul_revdial::RevdialError;

/// Errors from a v2 multiplexed session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("stream open cancelled")]
    Cancelled,

    #[error("stream open timed out")]
    OpenTimeout,

    #[error("session does not accept inbound streams")]
    InboundDisabled,

    #[error("yamux: {0}")]
    Yamux(#[from] yamux::ConnectionError),
}

/// Errors from registering transports or dialing through them.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("no connection for {0}")]
    NoConnection(DeviceKey),

    #[error("invalid device key: {0}")]
    InvalidKey(#[from] ProtocolError),

    #[error("v1 dial failed: {0}")]
    Revdial(#[from] RevdialError),

    #[error("v2 stream open failed: {0}")]
    Session(#[from] SessionError),
}
