//! WebSocket upgrades towards the tunnel server.

use std::io;

use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::debug;

use backhaul_protocol::constants::{HEADER_DEVICE_UID, HEADER_TENANT_ID, WS_MAX_MESSAGE_SIZE};
use backhaul_revdial::{BoxedConn, PickupDialer, PickupFuture, RevdialError};
use backhaul_wsconn::WsConn;

use crate::config::AgentConfig;
use crate::error::AgentError;

pub(crate) type ServerSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Builds an upgrade request for `url` carrying the agent identity headers.
pub(crate) fn upgrade_request(url: &str, config: &AgentConfig) -> Result<Request, AgentError> {
    let mut request = url.into_client_request()?;
    for (name, value) in [
        (HEADER_TENANT_ID, &config.tenant_id),
        (HEADER_DEVICE_UID, &config.device_id),
    ] {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AgentError::Config(format!("header {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AgentError::Config(format!("header {name}: {e}")))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

/// Performs the upgrade; fails unless the server answers 101.
pub(crate) async fn connect(request: Request) -> Result<ServerSocket, tungstenite::Error> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    let (ws, response) = connect_async_with_config(request, Some(ws_config), true).await?;
    debug!(status = response.status().as_u16(), "upgrade complete");
    Ok(ws)
}

/// [`PickupDialer`] that upgrades `server_url + connPath` to a WebSocket.
pub struct WsPickupDialer {
    config: AgentConfig,
}

impl WsPickupDialer {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    async fn pickup(&self, path: &str) -> Result<BoxedConn, RevdialError> {
        let request = upgrade_request(&self.config.url_for(path), &self.config)
            .map_err(|e| RevdialError::PickupFailed(e.to_string()))?;
        match connect(request).await {
            Ok(ws) => Ok(Box::new(WsConn::new(ws))),
            Err(tungstenite::Error::Http(response)) => {
                Err(RevdialError::BadStatus(response.status().as_u16()))
            }
            Err(e) => Err(RevdialError::Io(io::Error::other(e))),
        }
    }
}

impl PickupDialer for WsPickupDialer {
    fn dial<'a>(&'a self, path: &'a str) -> PickupFuture<'a> {
        Box::pin(self.pickup(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_identity() {
        let config = AgentConfig::new("ws://127.0.0.1:9000", "tenantA", "dev1");
        let request = upgrade_request(&config.connect_url(), &config).unwrap();
        assert_eq!(request.uri().path(), "/agent/connection");
        assert_eq!(request.headers().get(HEADER_TENANT_ID).unwrap(), "tenantA");
        assert_eq!(request.headers().get(HEADER_DEVICE_UID).unwrap(), "dev1");
    }

    #[test]
    fn invalid_identity_rejected() {
        let config = AgentConfig::new("ws://127.0.0.1:9000", "bad\ntenant", "dev1");
        let result = upgrade_request(&config.connect_url(), &config);
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn refused_pickup_is_io_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = WsPickupDialer::new(AgentConfig::new(format!("ws://{addr}"), "t", "d"));
        let result = dialer.dial("/ssh/revdial?dialer=x&uuid=y").await;
        assert!(matches!(result, Err(RevdialError::Io(_))));
    }
}
