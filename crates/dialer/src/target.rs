//! Per-purpose handshakes run on a freshly dialed logical connection.
//!
//! | Target | v1 | v2 |
//! |---|---|---|
//! | [`SshOpenTarget`] | `GET /ssh/<id>` | `/ssh/open/1.0.0` + `{"id"}` |
//! | [`SshCloseTarget`] | `GET /ssh/close/<id>` | `/ssh/close/1.0.0` + `{"id"}` |
//! | [`HttpProxyTarget`] | replayed `CONNECT`, expects `200` | `/http/proxy/1.0.0` + `{"id","host","port"}`, expects `{"status":"ok"}` |

use std::pin::Pin;

use backhaul_protocol::constants::{PROTO_HTTP_PROXY, PROTO_SSH_CLOSE, PROTO_SSH_OPEN};
use backhaul_protocol::headers::{read_json_line, write_json_line};
use backhaul_protocol::http1::{RequestHead, ResponseHead};
use backhaul_protocol::multistream::select_proto;
use backhaul_protocol::{ConnVersion, ProtocolError, ProxyReply, ProxyRequest, SessionHeader};
use backhaul_revdial::BoxedConn;

pub type PrepareFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxedConn, ProtocolError>> + Send + 'a>>;

/// Prepares a logical connection for one application purpose.
///
/// Implementations speak whichever sub-protocol matches `version`, so
/// callers never branch on it. A failed handshake fails the whole dial.
pub trait Target: Send + Sync {
    /// Short name used in errors and logs.
    fn name(&self) -> &'static str;

    fn supports(&self, _version: ConnVersion) -> bool {
        true
    }

    fn prepare<'a>(&'a self, conn: BoxedConn, version: ConnVersion) -> PrepareFuture<'a>;
}

/// Opens the SSH session `session_id` on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOpenTarget {
    pub session_id: String,
}

impl SshOpenTarget {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

impl Target for SshOpenTarget {
    fn name(&self) -> &'static str {
        "ssh-open"
    }

    fn prepare<'a>(&'a self, mut conn: BoxedConn, version: ConnVersion) -> PrepareFuture<'a> {
        Box::pin(async move {
            match version {
                ConnVersion::V1 => {
                    RequestHead::get(format!("/ssh/{}", self.session_id))
                        .write_to(&mut conn)
                        .await?;
                }
                ConnVersion::V2 => {
                    select_proto(&mut conn, PROTO_SSH_OPEN).await?;
                    let header = SessionHeader {
                        id: self.session_id.clone(),
                    };
                    write_json_line(&mut conn, &header).await?;
                }
            }
            Ok(conn)
        })
    }
}

/// Tells the device to tear down SSH session `session_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCloseTarget {
    pub session_id: String,
}

impl SshCloseTarget {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

impl Target for SshCloseTarget {
    fn name(&self) -> &'static str {
        "ssh-close"
    }

    fn prepare<'a>(&'a self, mut conn: BoxedConn, version: ConnVersion) -> PrepareFuture<'a> {
        Box::pin(async move {
            match version {
                ConnVersion::V1 => {
                    RequestHead::get(format!("/ssh/close/{}", self.session_id))
                        .write_to(&mut conn)
                        .await?;
                }
                ConnVersion::V2 => {
                    select_proto(&mut conn, PROTO_SSH_CLOSE).await?;
                    let header = SessionHeader {
                        id: self.session_id.clone(),
                    };
                    write_json_line(&mut conn, &header).await?;
                }
            }
            Ok(conn)
        })
    }
}

/// Proxies a TCP connection to `host:port` as seen from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProxyTarget {
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Request replayed on v1 connections.
    pub handshake: RequestHead,
}

impl HttpProxyTarget {
    /// Builds a target whose v1 handshake is `CONNECT host:port`.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let authority = format!("{host}:{port}");
        Self {
            id: id.into(),
            handshake: RequestHead::new("CONNECT", authority.clone()).header("Host", authority),
            host,
            port,
        }
    }

    /// Replaces the v1 handshake with a caller-supplied request.
    pub fn with_handshake(mut self, handshake: RequestHead) -> Self {
        self.handshake = handshake;
        self
    }
}

impl Target for HttpProxyTarget {
    fn name(&self) -> &'static str {
        "http-proxy"
    }

    fn prepare<'a>(&'a self, mut conn: BoxedConn, version: ConnVersion) -> PrepareFuture<'a> {
        Box::pin(async move {
            match version {
                ConnVersion::V1 => {
                    self.handshake.write_to(&mut conn).await?;
                    let resp = ResponseHead::read_from(&mut conn).await?;
                    if resp.status != 200 {
                        return Err(ProtocolError::Http(format!(
                            "proxy handshake answered {} {}",
                            resp.status, resp.reason
                        )));
                    }
                }
                ConnVersion::V2 => {
                    select_proto(&mut conn, PROTO_HTTP_PROXY).await?;
                    let req = ProxyRequest {
                        id: self.id.clone(),
                        host: self.host.clone(),
                        port: self.port,
                    };
                    write_json_line(&mut conn, &req).await?;
                    let reply: ProxyReply = read_json_line(&mut conn).await?;
                    if !reply.is_ok() {
                        return Err(ProtocolError::Handshake(format!(
                            "proxy refused ({}): {}",
                            reply.status, reply.message
                        )));
                    }
                }
            }
            Ok(conn)
        })
    }
}
