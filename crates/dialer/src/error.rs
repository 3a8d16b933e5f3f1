use backhaul_connman::ManagerError;
use backhaul_protocol::{ConnVersion, ProtocolError};
use backhaul_throttle::ThrottleError;

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("{target} handshake over {version} failed: {source}")]
    Negotiation {
        target: &'static str,
        version: ConnVersion,
        #[source]
        source: ProtocolError,
    },

    #[error("{target} does not support {version} connections")]
    UnsupportedVersion {
        target: &'static str,
        version: ConnVersion,
    },

    #[error("dial cancelled")]
    Cancelled,

    #[error("throttle configuration: {0}")]
    Throttle(#[from] ThrottleError),
}

impl DialError {
    /// Whether the device simply has no registered transport.
    pub fn is_no_connection(&self) -> bool {
        matches!(self, DialError::Manager(ManagerError::NoConnection(_)))
    }
}
