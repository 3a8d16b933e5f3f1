//! Tunnel accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use backhaul_dialer::Dialer;
use backhaul_protocol::ConnVersion;
use backhaul_protocol::constants::{PICKUP_PATH, WS_MAX_MESSAGE_SIZE};
use backhaul_wsconn::WsConn;

use crate::ServerError;
use crate::route::{self, Route};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (port 0 = OS-assigned).
    pub bind: SocketAddr,
    /// Base path advertised to v1 agents for pick-up upgrades.
    pub pickup_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: ([0, 0, 0, 0], 8080).into(),
            pickup_path: PICKUP_PATH.into(),
        }
    }
}

/// Accepts agent transports and pick-up connections, feeding them to a
/// [`Dialer`].
pub struct TunnelServer {
    config: ServerConfig,
    dialer: Arc<Dialer>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig, dialer: Arc<Dialer>) -> Arc<Self> {
        Arc::new(Self {
            config,
            dialer,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn dialer(&self) -> &Arc<Dialer> {
        &self.dialer
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available once [`run`](Self::run) or [`serve`](Self::serve)
    /// has started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Stops accepting and closes every registered transport.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind).await?;
        self.serve(listener).await
    }

    /// Serves an already bound listener until shutdown.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!("tunnel server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("tunnel server shutting down");
                    self.dialer.manager().shutdown();
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("accept error: {e}"),
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection and hands the socket to its route.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let _ = stream.set_nodelay(true);
        let registry = self.dialer.manager().registry().clone();
        let mut routed = None;
        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match route::route(req, &registry, &self.config.pickup_path) {
                Ok(r) => {
                    routed = Some(r);
                    Ok(response)
                }
                Err(rejection) => {
                    debug!(
                        %peer_addr,
                        path = req.uri().path(),
                        status = rejection.status.as_u16(),
                        "upgrade refused: {}",
                        rejection.reason
                    );
                    Err(rejection.into_response())
                }
            }
        };

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws = match accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
            Ok(ws) => ws,
            // Already answered with the rejection status.
            Err(tungstenite::Error::Http(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let Some(route) = routed else {
            return Ok(());
        };

        let conn = WsConn::new(ws);
        match route {
            Route::Agent { key, version } => {
                info!(%peer_addr, %key, %version, "agent transport connected");
                match version {
                    ConnVersion::V1 => self.dialer.set(key, conn, &self.config.pickup_path),
                    ConnVersion::V2 => {
                        self.dialer.bind(key.tenant(), key.device(), conn)?;
                    }
                }
            }
            Route::Pickup(query) => {
                debug!(dialer = %query.dialer, uuid = %query.uuid, "pick-up connected");
                let registry = self.dialer.manager().registry();
                if let Err(e) = registry.pickup(&query.dialer, &query.uuid, Box::new(conn)).await {
                    warn!(dialer = %query.dialer, uuid = %query.uuid, "pick-up not delivered: {e}");
                }
            }
        }
        Ok(())
    }
}
