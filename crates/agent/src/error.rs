//! Error types for the agent runtime.

use backhaul_connman::SessionError;
use backhaul_protocol::ProtocolError;
use backhaul_revdial::RevdialError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Revdial(#[from] RevdialError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unexpected request: {0}")]
    UnexpectedRequest(String),
}
