//! [`Handler`] that bridges requests to local TCP services.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use backhaul_revdial::BoxedConn;

use crate::handler::{ConnectFuture, Handler, HandlerFuture};

/// Forwards SSH sessions to a local daemon and proxies to `host:port`.
///
/// Open SSH sessions are tracked by id so a later close request can cut
/// them; opening an id that is already live replaces the old session.
pub struct ForwardHandler {
    ssh_addr: String,
    sessions: Mutex<HashMap<String, (u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl ForwardHandler {
    pub fn new(ssh_addr: impl Into<String>) -> Self {
        Self {
            ssh_addr: ssh_addr.into(),
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of SSH sessions currently being forwarded.
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or_default()
    }

    fn track(&self, session_id: &str) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Ok(mut sessions) = self.sessions.lock() {
            if let Some((_, old)) = sessions.insert(session_id.to_string(), (id, token.clone())) {
                warn!(session = session_id, "replacing live ssh session");
                old.cancel();
            }
        }
        (id, token)
    }

    fn untrack(&self, session_id: &str, id: u64) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if sessions.get(session_id).is_some_and(|(current, _)| *current == id) {
                sessions.remove(session_id);
            }
        }
    }
}

impl Handler for ForwardHandler {
    fn on_ssh_open(&self, session_id: String, mut conn: BoxedConn) -> HandlerFuture<'_> {
        Box::pin(async move {
            let mut upstream = TcpStream::connect(&self.ssh_addr).await?;
            let _ = upstream.set_nodelay(true);
            let (id, token) = self.track(&session_id);
            info!(session = %session_id, addr = %self.ssh_addr, "ssh session opened");

            let result = tokio::select! {
                _ = token.cancelled() => {
                    debug!(session = %session_id, "ssh session cancelled");
                    Ok(())
                }
                r = tokio::io::copy_bidirectional(&mut conn, &mut upstream) => r.map(|_| ()),
            };

            self.untrack(&session_id, id);
            info!(session = %session_id, "ssh session ended");
            result?;
            Ok(())
        })
    }

    fn on_ssh_close(&self, session_id: String) -> HandlerFuture<'_> {
        Box::pin(async move {
            let removed = self
                .sessions
                .lock()
                .ok()
                .and_then(|mut s| s.remove(&session_id));
            match removed {
                Some((_, token)) => {
                    token.cancel();
                    info!(session = %session_id, "ssh session closed on request");
                }
                None => debug!(session = %session_id, "close for unknown ssh session"),
            }
            Ok(())
        })
    }

    fn on_http_proxy(&self, _id: String, host: String, port: u16) -> ConnectFuture<'_> {
        Box::pin(async move {
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream) as BoxedConn)
        })
    }
}
