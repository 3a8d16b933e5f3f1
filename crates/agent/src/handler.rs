//! Handler trait for requests arriving over logical connections.
//!
//! The runtime parses the request (an HTTP/1.1 head on v1, a negotiated
//! protocol id plus JSON header on v2) and calls the matching method; the
//! handler only sees the decoded request and the connection itself.

use std::io;
use std::pin::Pin;

use backhaul_revdial::BoxedConn;

use crate::error::AgentError;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + 'a>>;

/// A boxed future resolving to an upstream connection.
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxedConn>> + Send + 'a>>;

pub trait Handler: Send + Sync + 'static {
    /// Serves SSH session `session_id` over `conn` until either side hangs up.
    fn on_ssh_open(&self, session_id: String, conn: BoxedConn) -> HandlerFuture<'_>;

    /// Tears down SSH session `session_id`.
    fn on_ssh_close(&self, session_id: String) -> HandlerFuture<'_>;

    /// Connects to the proxy target.
    ///
    /// The runtime replies success or failure to the server based on the
    /// result and then pipes bytes between both ends. `id` is empty for v1
    /// requests, which carry none.
    fn on_http_proxy(&self, id: String, host: String, port: u16) -> ConnectFuture<'_>;
}
