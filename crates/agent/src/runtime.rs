//! Registration and reconnect loop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use backhaul_connman::{Session, SessionConfig};
use backhaul_protocol::{ConnVersion, DeviceKey};
use backhaul_revdial::{Listener, ListenerConfig};
use backhaul_wsconn::WsConn;

use crate::config::AgentConfig;
use crate::dispatch;
use crate::error::AgentError;
use crate::handler::Handler;
use crate::pickup::{self, WsPickupDialer};

/// Keeps one transport to the tunnel server alive and serves it.
pub struct Agent<H: Handler> {
    config: AgentConfig,
    handler: Arc<H>,
    listener_config: ListenerConfig,
    session_config: SessionConfig,
}

impl<H: Handler> Agent<H> {
    pub fn new(config: AgentConfig, handler: Arc<H>) -> Self {
        Self {
            config,
            handler,
            listener_config: ListenerConfig::default(),
            session_config: SessionConfig::default(),
        }
    }

    pub fn with_listener_config(mut self, config: ListenerConfig) -> Self {
        self.listener_config = config;
        self
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Connects, serves until the transport drops, backs off and retries.
    ///
    /// Returns once `cancel` fires, or immediately if the identity cannot
    /// form a valid device key.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), AgentError> {
        let key = DeviceKey::new(self.config.tenant_id.as_str(), self.config.device_id.as_str())?;
        let mut attempt: u32 = 0;

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                r = self.connect() => r,
            };

            match connected {
                Ok(conn) => {
                    attempt = 0;
                    info!(%key, version = %self.config.version, "registered with server");
                    self.serve(conn, cancel).await;
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    info!(%key, "transport to server lost");
                }
                Err(e) => warn!(%key, url = %self.config.connect_url(), "connect failed: {e}"),
            }

            attempt = attempt.saturating_add(1);
            let delay = self.config.reconnect.delay_for_attempt(attempt);
            let delay_secs = delay.as_secs_f64();
            info!(
                attempt,
                delay_secs = format_args!("{delay_secs:.1}"),
                "reconnecting"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reconnect cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn connect(&self) -> Result<WsConn, AgentError> {
        let request = pickup::upgrade_request(&self.config.connect_url(), &self.config)?;
        let ws = pickup::connect(request).await?;
        Ok(WsConn::new(ws))
    }

    /// Serves one registered transport until it closes or `cancel` fires.
    pub async fn serve(&self, conn: WsConn, cancel: &CancellationToken) {
        match self.config.version {
            ConnVersion::V1 => self.serve_v1(conn, cancel).await,
            ConnVersion::V2 => self.serve_v2(conn, cancel).await,
        }
    }

    async fn serve_v1(&self, conn: WsConn, cancel: &CancellationToken) {
        let dialer = Arc::new(WsPickupDialer::new(self.config.clone()));
        let listener = Listener::with_config(conn, dialer, self.listener_config.clone());

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                r = listener.accept() => r,
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("listener ended: {e}");
                    break;
                }
            };

            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatch::serve_v1(&*handler, conn).await {
                    warn!(version = "v1", "request failed: {e}");
                }
            });
        }
        listener.close();
    }

    async fn serve_v2(&self, conn: WsConn, cancel: &CancellationToken) {
        let session = Session::server(conn, self.session_config.clone());

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                r = session.accept() => r,
            };
            let stream = match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("session ended: {e}");
                    break;
                }
            };

            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatch::serve_v2(&*handler, stream).await {
                    warn!(version = "v2", "request failed: {e}");
                }
            });
        }
        session.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    use backhaul_protocol::constants::PROTO_SSH_OPEN;
    use backhaul_protocol::headers::write_json_line;
    use backhaul_protocol::multistream::select_proto;
    use backhaul_protocol::SessionHeader;
    use backhaul_revdial::BoxedConn;

    use super::*;
    use crate::handler::{ConnectFuture, HandlerFuture};

    struct Echo;

    impl Handler for Echo {
        fn on_ssh_open(&self, _id: String, mut conn: BoxedConn) -> HandlerFuture<'_> {
            Box::pin(async move {
                let mut buf = [0u8; 64];
                loop {
                    let n = conn.read(&mut buf).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    conn.write_all(&buf[..n]).await?;
                }
            })
        }

        fn on_ssh_close(&self, _id: String) -> HandlerFuture<'_> {
            Box::pin(async { Ok(()) })
        }

        fn on_http_proxy(&self, _id: String, _host: String, _port: u16) -> ConnectFuture<'_> {
            Box::pin(async { Err(std::io::ErrorKind::ConnectionRefused.into()) })
        }
    }

    async fn ws_pair() -> (WsConn, WsConn) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (WsConn::new(client), WsConn::new(server))
    }

    #[tokio::test]
    async fn invalid_identity_fails_fast() {
        let agent = Agent::new(AgentConfig::new("ws://127.0.0.1:1", "", "dev"), Arc::new(Echo));
        let result = agent.run(&CancellationToken::new()).await;
        assert!(matches!(result, Err(AgentError::Protocol(_))));
    }

    #[tokio::test]
    async fn cancel_stops_reconnect_loop() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let agent = Arc::new(Agent::new(
            AgentConfig::new(format!("ws://{addr}"), "t", "d"),
            Arc::new(Echo),
        ));
        let cancel = CancellationToken::new();
        let task = {
            let agent = agent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("run did not stop after cancel");
        result.unwrap().unwrap();
    }

    #[tokio::test]
    async fn v2_serve_dispatches_streams() {
        let (server_side, agent_side) = ws_pair().await;
        let session = Session::client(server_side, SessionConfig::default());

        let agent = Arc::new(Agent::new(
            AgentConfig::new("ws://unused", "t", "d"),
            Arc::new(Echo),
        ));
        let cancel = CancellationToken::new();
        let serve = {
            let agent = agent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.serve(agent_side, &cancel).await })
        };

        let mut streams = Vec::new();
        for i in 0..3 {
            let mut stream = session.open(&CancellationToken::new()).await.unwrap();
            select_proto(&mut stream, PROTO_SSH_OPEN).await.unwrap();
            write_json_line(&mut stream, &SessionHeader { id: format!("s{i}") })
                .await
                .unwrap();
            streams.push(stream);
        }
        for (i, stream) in streams.iter_mut().enumerate() {
            let msg = format!("hello {i}");
            stream.write_all(msg.as_bytes()).await.unwrap();
            let mut buf = vec![0u8; msg.len()];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, msg.as_bytes());
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), serve)
            .await
            .expect("serve did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn v2_serve_returns_when_transport_drops() {
        let (server_side, agent_side) = ws_pair().await;
        let agent = Agent::new(AgentConfig::new("ws://unused", "t", "d"), Arc::new(Echo));

        drop(server_side);
        tokio::time::timeout(
            Duration::from_secs(2),
            agent.serve(agent_side, &CancellationToken::new()),
        )
        .await
        .expect("serve did not notice the dropped transport");
    }
}
