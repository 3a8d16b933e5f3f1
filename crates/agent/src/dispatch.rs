//! Request parsing and dispatch for one logical connection.

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use backhaul_protocol::constants::{PROTO_HTTP_PROXY, PROTO_SSH_CLOSE, PROTO_SSH_OPEN};
use backhaul_protocol::headers::{read_json_line, write_json_line};
use backhaul_protocol::http1::{RequestHead, ResponseHead};
use backhaul_protocol::multistream::negotiate;
use backhaul_protocol::{ConnVersion, ProtocolError, ProxyReply, ProxyRequest, SessionHeader};
use backhaul_revdial::BoxedConn;

use crate::error::AgentError;
use crate::handler::Handler;

const SUPPORTED_PROTOCOLS: &[&str] = &[PROTO_SSH_OPEN, PROTO_SSH_CLOSE, PROTO_HTTP_PROXY];

/// Serves a v1 logical connection: one HTTP/1.1 request head, then bytes.
pub(crate) async fn serve_v1<H: Handler + ?Sized>(
    handler: &H,
    mut conn: BoxedConn,
) -> Result<(), AgentError> {
    let head = RequestHead::read_from(&mut conn).await?;
    debug!(method = %head.method, target = %head.target, "v1 request");

    match head.method.as_str() {
        "CONNECT" => {
            let (host, port) = split_authority(&head.target)?;
            proxy(handler, conn, ConnVersion::V1, String::new(), host, port).await
        }
        "GET" => {
            if let Some(id) = head.target.strip_prefix("/ssh/close/") {
                let result = handler.on_ssh_close(id.to_string()).await;
                let _ = conn.shutdown().await;
                result
            } else if let Some(id) = head.target.strip_prefix("/ssh/") {
                handler.on_ssh_open(id.to_string(), conn).await
            } else {
                Err(AgentError::UnexpectedRequest(head.target))
            }
        }
        _ => Err(AgentError::UnexpectedRequest(format!(
            "{} {}",
            head.method, head.target
        ))),
    }
}

/// Serves a v2 stream: multistream negotiation, one JSON header, then bytes.
pub(crate) async fn serve_v2<H: Handler + ?Sized>(
    handler: &H,
    mut stream: BoxedConn,
) -> Result<(), AgentError> {
    let proto = negotiate(&mut stream, SUPPORTED_PROTOCOLS).await?;
    debug!(proto, "v2 stream negotiated");

    match proto {
        PROTO_SSH_OPEN => {
            let header: SessionHeader = read_json_line(&mut stream).await?;
            handler.on_ssh_open(header.id, stream).await
        }
        PROTO_SSH_CLOSE => {
            let header: SessionHeader = read_json_line(&mut stream).await?;
            let result = handler.on_ssh_close(header.id).await;
            let _ = stream.shutdown().await;
            result
        }
        PROTO_HTTP_PROXY => {
            let req: ProxyRequest = read_json_line(&mut stream).await?;
            proxy(handler, stream, ConnVersion::V2, req.id, req.host, req.port).await
        }
        other => Err(AgentError::UnexpectedRequest(other.to_string())),
    }
}

async fn proxy<H: Handler + ?Sized>(
    handler: &H,
    mut conn: BoxedConn,
    version: ConnVersion,
    id: String,
    host: String,
    port: u16,
) -> Result<(), AgentError> {
    let mut upstream = match handler.on_http_proxy(id, host.clone(), port).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(%host, port, %version, "proxy target unreachable: {e}");
            match version {
                ConnVersion::V1 => ResponseHead::new(502, "Bad Gateway").write_to(&mut conn).await?,
                ConnVersion::V2 => {
                    write_json_line(&mut conn, &ProxyReply::failed(e.to_string())).await?
                }
            }
            let _ = conn.shutdown().await;
            return Ok(());
        }
    };

    match version {
        ConnVersion::V1 => {
            ResponseHead::new(200, "Connection established")
                .write_to(&mut conn)
                .await?
        }
        ConnVersion::V2 => write_json_line(&mut conn, &ProxyReply::ok()).await?,
    }

    let (sent, received) = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    debug!(%host, port, sent, received, "proxy finished");
    Ok(())
}

/// Splits an authority-form target (`host:port`, `[v6]:port`).
fn split_authority(target: &str) -> Result<(String, u16), ProtocolError> {
    let bad = || ProtocolError::Http(format!("bad CONNECT target: {target}"));
    let (host, port) = target.rsplit_once(':').ok_or_else(bad)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(bad());
    }
    let port = port.parse::<u16>().map_err(|_| bad())?;
    Ok((host.to_string(), port))
}
