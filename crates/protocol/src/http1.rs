//! Minimal HTTP/1.1 head codec for v1 logical connections.
//!
//! A v1 logical connection starts with exactly one request head written by
//! the server; the proxy flavour is answered by one response head. Bodies
//! never follow, the connection turns into a raw byte pipe afterwards, so
//! heads are read byte by byte and nothing past the blank line is consumed.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_HEAD_SIZE;
use crate::error::ProtocolError;

/// Request line plus headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Origin-form path (`/ssh/abc`) or authority-form target (`host:port`).
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: Vec::new(),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new("GET", target)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.1\r\n", self.method, self.target);
        for (k, v) in &self.headers {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let head = read_head(reader).await?;
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();

        let mut parts = request_line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::Http(format!("bad request line: {request_line}")));
        };
        if !version.starts_with("HTTP/1.") || method.is_empty() || target.is_empty() {
            return Err(ProtocolError::Http(format!("bad request line: {request_line}")));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            headers: parse_headers(lines)?,
        })
    }
}

/// Status line of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
}

impl ResponseHead {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        let out = format!("HTTP/1.1 {} {}\r\n\r\n", self.status, self.reason);
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, ProtocolError> {
        let head = read_head(reader).await?;
        let status_line = head.split("\r\n").next().unwrap_or_default();

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(ProtocolError::Http(format!("bad status line: {status_line}")));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| ProtocolError::Http(format!("bad status line: {status_line}")))?;

        Ok(Self {
            status,
            reason: parts.next().unwrap_or_default().to_string(),
        })
    }
}

fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>, ProtocolError> {
    let mut headers = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::Http(format!("bad header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// Reads everything up to and excluding the blank line ending the head.
async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, ProtocolError> {
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.push(reader.read_u8().await?);
        if buf.ends_with(b"\r\n\r\n") {
            buf.truncate(buf.len() - 4);
            break;
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProtocolError::TooLong {
                len: buf.len(),
                max: MAX_HEAD_SIZE,
            });
        }
    }
    String::from_utf8(buf).map_err(|e| ProtocolError::Http(format!("head is not UTF-8: {e}")))
}
