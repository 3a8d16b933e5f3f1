//! v2 per-stream JSON headers.
//!
//! After multistream negotiation the opener writes exactly one JSON line
//! describing the request. The HTTP proxy protocol answers with one JSON
//! line of its own before payload bytes flow.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_HEAD_SIZE;
use crate::error::ProtocolError;

/// Body of `/ssh/open/1.0.0` and `/ssh/close/1.0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub id: String,
}

/// Body of `/http/proxy/1.0.0` requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub id: String,
    pub host: String,
    pub port: u16,
}

/// Status value meaning the proxy target is connected.
pub const PROXY_STATUS_OK: &str = "ok";

/// Status value meaning the agent could not reach the proxy target.
pub const PROXY_STATUS_FAILED: &str = "failed";

/// Reply to a `/http/proxy/1.0.0` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyReply {
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ProxyReply {
    pub fn ok() -> Self {
        Self {
            status: PROXY_STATUS_OK.into(),
            message: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: PROXY_STATUS_FAILED.into(),
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == PROXY_STATUS_OK
    }
}

/// Writes `value` as one JSON line.
pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one JSON line and decodes it.
///
/// Reads byte by byte so nothing past the newline is consumed; whatever
/// follows belongs to the payload.
pub async fn read_json_line<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let line = read_line(reader, MAX_HEAD_SIZE).await?;
    Ok(serde_json::from_slice(&line)?)
}

/// Reads up to and excluding the next `\n`.
pub(crate) async fn read_line<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            return Ok(line);
        }
        if line.len() >= max {
            return Err(ProtocolError::TooLong {
                len: line.len() + 1,
                max,
            });
        }
        line.push(byte);
    }
}
