//! multistream-select 1.0.0 negotiation.
//!
//! Every message is a uvarint length prefix followed by the payload and a
//! trailing newline (the newline is counted in the length):
//!
//! ```text
//! opener   -> /multistream/1.0.0\n
//! opener   -> /ssh/open/1.0.0\n
//! acceptor -> /multistream/1.0.0\n
//! acceptor -> /ssh/open/1.0.0\n      (or "na\n" when unsupported)
//! ```
//!
//! Reads are exact, so the stream is positioned at the first payload byte
//! once negotiation returns.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_HEAD_SIZE;
use crate::error::ProtocolError;

/// Protocol header exchanged before any protocol id.
pub const MULTISTREAM_HEADER: &str = "/multistream/1.0.0";

/// Reply sent for an unsupported protocol id.
pub const NOT_AVAILABLE: &str = "na";

/// Request for the acceptor's protocol list.
pub const LIST: &str = "ls";

/// Opener side: selects `proto` or fails.
pub async fn select_proto<S>(io: &mut S, proto: &str) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut out = Vec::new();
    encode_msg(&mut out, MULTISTREAM_HEADER);
    encode_msg(&mut out, proto);
    io.write_all(&out).await?;
    io.flush().await?;

    let header = read_msg(io).await?;
    if header != MULTISTREAM_HEADER {
        return Err(ProtocolError::Handshake(format!(
            "unexpected multistream header: {header}"
        )));
    }

    let reply = read_msg(io).await?;
    if reply == proto {
        Ok(())
    } else if reply == NOT_AVAILABLE {
        Err(ProtocolError::NotSupported(proto.to_string()))
    } else {
        Err(ProtocolError::Handshake(format!(
            "peer answered {reply} to {proto}"
        )))
    }
}

/// Acceptor side: waits for the opener to pick one of `supported`.
///
/// Unsupported ids are answered with `na` and the loop keeps waiting, so
/// the opener may try another one.
pub async fn negotiate<'a, S>(io: &mut S, supported: &[&'a str]) -> Result<&'a str, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let header = read_msg(io).await?;
    if header != MULTISTREAM_HEADER {
        return Err(ProtocolError::Handshake(format!(
            "unexpected multistream header: {header}"
        )));
    }
    write_msg(io, MULTISTREAM_HEADER).await?;

    loop {
        let proto = read_msg(io).await?;
        if let Some(&found) = supported.iter().find(|p| **p == proto) {
            write_msg(io, found).await?;
            return Ok(found);
        }

        if proto == LIST {
            let mut listing = Vec::new();
            for p in supported {
                encode_msg(&mut listing, p);
            }
            let mut out = Vec::new();
            put_uvarint(&mut out, listing.len() as u64 + 1);
            out.extend_from_slice(&listing);
            out.push(b'\n');
            io.write_all(&out).await?;
            io.flush().await?;
        } else {
            write_msg(io, NOT_AVAILABLE).await?;
        }
    }
}

async fn write_msg<W: AsyncWrite + Unpin>(io: &mut W, msg: &str) -> Result<(), ProtocolError> {
    let mut out = Vec::new();
    encode_msg(&mut out, msg);
    io.write_all(&out).await?;
    io.flush().await?;
    Ok(())
}

fn encode_msg(out: &mut Vec<u8>, msg: &str) {
    put_uvarint(out, msg.len() as u64 + 1);
    out.extend_from_slice(msg.as_bytes());
    out.push(b'\n');
}

async fn read_msg<R: AsyncRead + Unpin>(io: &mut R) -> Result<String, ProtocolError> {
    let len = read_uvarint(io).await? as usize;
    if len == 0 {
        return Err(ProtocolError::Handshake("empty multistream message".into()));
    }
    if len > MAX_HEAD_SIZE {
        return Err(ProtocolError::TooLong {
            len,
            max: MAX_HEAD_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    if buf.pop() != Some(b'\n') {
        return Err(ProtocolError::Handshake(
            "multistream message missing trailing newline".into(),
        ));
    }
    String::from_utf8(buf)
        .map_err(|e| ProtocolError::Handshake(format!("invalid UTF-8 in multistream message: {e}")))
}

fn put_uvarint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

async fn read_uvarint<R: AsyncRead + Unpin>(io: &mut R) -> Result<u64, ProtocolError> {
    let mut value = 0u64;
    for i in 0..10 {
        let byte = io.read_u8().await?;
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ProtocolError::Handshake("uvarint overflow".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{PROTO_HTTP_PROXY, PROTO_SSH_CLOSE, PROTO_SSH_OPEN};

    #[test]
    fn uvarint_encoding() {
        let mut out = Vec::new();
        put_uvarint(&mut out, 19);
        assert_eq!(out, [19]);

        out.clear();
        put_uvarint(&mut out, 300);
        assert_eq!(out, [0xac, 0x02]);
    }

    #[test]
    fn header_message_bytes() {
        let mut out = Vec::new();
        encode_msg(&mut out, MULTISTREAM_HEADER);
        assert_eq!(out[0] as usize, MULTISTREAM_HEADER.len() + 1);
        assert_eq!(&out[1..out.len() - 1], MULTISTREAM_HEADER.as_bytes());
        assert_eq!(out.last(), Some(&b'\n'));
    }

    #[tokio::test]
    async fn select_and_negotiate_agree() {
        let (mut opener, mut acceptor) = tokio::io::duplex(1024);

        let acceptor_task = tokio::spawn(async move {
            let proto = negotiate(
                &mut acceptor,
                &[PROTO_SSH_OPEN, PROTO_SSH_CLOSE, PROTO_HTTP_PROXY],
            )
            .await
            .unwrap();
            let mut payload = [0u8; 5];
            acceptor.read_exact(&mut payload).await.unwrap();
            (proto, payload)
        });

        select_proto(&mut opener, PROTO_SSH_CLOSE).await.unwrap();
        opener.write_all(b"hello").await.unwrap();

        let (proto, payload) = acceptor_task.await.unwrap();
        assert_eq!(proto, PROTO_SSH_CLOSE);
        assert_eq!(&payload, b"hello");
    }

    #[tokio::test]
    async fn unsupported_protocol_is_rejected() {
        let (mut opener, mut acceptor) = tokio::io::duplex(1024);

        let acceptor_task = tokio::spawn(async move {
            // Keeps waiting after "na"; ends when the opener hangs up.
            negotiate(&mut acceptor, &[PROTO_SSH_OPEN]).await
        });

        let result = select_proto(&mut opener, PROTO_HTTP_PROXY).await;
        assert!(matches!(result, Err(ProtocolError::NotSupported(p)) if p == PROTO_HTTP_PROXY));

        drop(opener);
        assert!(acceptor_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn bad_header_is_rejected() {
        let mut out = Vec::new();
        encode_msg(&mut out, "/multistream/2.0.0");
        let (mut opener, mut acceptor) = tokio::io::duplex(1024);
        opener.write_all(&out).await.unwrap();

        let result = negotiate(&mut acceptor, &[PROTO_SSH_OPEN]).await;
        assert!(matches!(result, Err(ProtocolError::Handshake(_))));
    }
}
