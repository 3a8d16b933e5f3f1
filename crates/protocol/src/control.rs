//! v1 control messages.
//!
//! One JSON object per line on the long-lived control socket:
//!
//! ```text
//! {"command":"keep-alive"}
//! {"command":"conn-ready","connPath":"/ssh/revdial?dialer=<id>&uuid=<req>"}
//! {"command":"pickup-failed","connPath":"<path>","err":"<message>"}
//! ```

use serde::{Deserialize, Serialize};

use crate::constants::MAX_CONTROL_LINE;
use crate::error::ProtocolError;

/// Control command carried by a [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    KeepAlive,
    ConnReady,
    PickupFailed,
    /// Any command this side does not understand. Ignored by both loops.
    #[serde(other)]
    Unknown,
}

/// Envelope for all v1 control traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub command: Command,
    #[serde(rename = "connPath", default, skip_serializing_if = "String::is_empty")]
    pub conn_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

impl ControlMessage {
    pub fn keep_alive() -> Self {
        Self {
            command: Command::KeepAlive,
            conn_path: String::new(),
            err: String::new(),
        }
    }

    /// Asks the listener to pick up a new connection at `conn_path`.
    pub fn conn_ready(conn_path: impl Into<String>) -> Self {
        Self {
            command: Command::ConnReady,
            conn_path: conn_path.into(),
            err: String::new(),
        }
    }

    /// Reports that picking up `conn_path` failed.
    pub fn pickup_failed(conn_path: impl Into<String>, err: impl Into<String>) -> Self {
        Self {
            command: Command::PickupFailed,
            conn_path: conn_path.into(),
            err: err.into(),
        }
    }

    /// Encodes the message as a single line, without the trailing newline.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let line = serde_json::to_string(self)?;
        if line.len() > MAX_CONTROL_LINE {
            return Err(ProtocolError::TooLong {
                len: line.len(),
                max: MAX_CONTROL_LINE,
            });
        }
        Ok(line)
    }

    /// Decodes one control line. Surrounding whitespace is ignored.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(line.trim())?)
    }
}
