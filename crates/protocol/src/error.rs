//! Error types for the wire protocol.

/// Errors produced while encoding, decoding or negotiating on the wire.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid device key: {0}")]
    InvalidKey(String),

    #[error("protocol not supported by peer: {0}")]
    NotSupported(String),

    #[error("malformed handshake: {0}")]
    Handshake(String),

    #[error("message too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("malformed HTTP head: {0}")]
    Http(String),
}
