//! Registration, liveness supervision and dialing of device transports.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use backhaul_protocol::constants::{PING_TIMEOUT, SESSION_PING_INTERVAL, V1_PROBE_INTERVAL};
use backhaul_protocol::{ConnVersion, DeviceKey};
use backhaul_revdial::{BoxedConn, Dialer, DialerRegistry};
use backhaul_wsconn::{Pinger, WsConn};

use crate::connections::{Connections, Transport};
use crate::error::ManagerError;
use crate::session::{Session, SessionConfig};

/// Callback invoked with the device a transport belongs to.
pub type TransportCallback = Box<dyn Fn(&DeviceKey) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Interval between liveness probes of v1 control sockets.
    pub v1_probe_interval: Duration,
    /// Interval between pings of v2 sessions.
    pub v2_ping_interval: Duration,
    pub ping_timeout: Duration,
    pub session: SessionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            v1_probe_interval: V1_PROBE_INTERVAL,
            v2_ping_interval: SESSION_PING_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            session: SessionConfig::default(),
        }
    }
}

/// Owns every registered device transport.
///
/// Each registration gets a supervisor task that probes the socket, calls
/// the keep-alive callback on every successful probe and, when the probe
/// or the transport fails, closes it, removes it and calls the terminate
/// callback exactly once.
pub struct Manager {
    connections: Connections,
    registry: Arc<DialerRegistry>,
    config: ManagerConfig,
    keep_alive: Option<TransportCallback>,
    terminate: Option<TransportCallback>,
}

impl Manager {
    pub fn new(registry: Arc<DialerRegistry>, config: ManagerConfig) -> Self {
        Self {
            connections: Connections::new(),
            registry,
            config,
            keep_alive: None,
            terminate: None,
        }
    }

    pub fn on_keep_alive(mut self, f: impl Fn(&DeviceKey) + Send + Sync + 'static) -> Self {
        self.keep_alive = Some(Box::new(f));
        self
    }

    pub fn on_terminate(mut self, f: impl Fn(&DeviceKey) + Send + Sync + 'static) -> Self {
        self.terminate = Some(Box::new(f));
        self
    }

    pub fn registry(&self) -> &Arc<DialerRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    /// Registers a v1 control socket under `key`.
    ///
    /// `pickup_path` is the path the agent is told to dial back on.
    pub fn set(self: &Arc<Self>, key: DeviceKey, conn: WsConn, pickup_path: &str) -> Arc<Dialer> {
        let pinger = conn.pinger();
        let dialer = Dialer::new(conn, pickup_path, &self.registry);
        let transport = Transport::V1(dialer.clone());
        let id = self.connections.store(&key, transport.clone());
        info!(key = %key, dialer = %dialer.id(), version = %ConnVersion::V1, "transport registered");

        tokio::spawn(self.clone().supervise(
            key,
            id,
            transport,
            pinger,
            self.config.v1_probe_interval,
        ));
        dialer
    }

    /// Registers a v2 socket for `tenant`/`device` and starts a session on it.
    pub fn bind(
        self: &Arc<Self>,
        tenant: &str,
        device: &str,
        conn: WsConn,
    ) -> Result<Arc<Session>, ManagerError> {
        let key = DeviceKey::new(tenant, device)?;
        let pinger = conn.pinger();
        let session = Arc::new(Session::client(conn, self.config.session.clone()));
        let transport = Transport::V2(session.clone());
        let id = self.connections.store(&key, transport.clone());
        info!(key = %key, version = %ConnVersion::V2, "transport registered");

        tokio::spawn(self.clone().supervise(
            key,
            id,
            transport,
            pinger,
            self.config.v2_ping_interval,
        ));
        Ok(session)
    }

    /// Opens a logical connection to `key`, tagged with the version of the
    /// transport it came from.
    pub async fn dial(
        &self,
        key: &DeviceKey,
        cancel: &CancellationToken,
    ) -> Result<(BoxedConn, ConnVersion), ManagerError> {
        let transport = self
            .connections
            .load(key)
            .ok_or_else(|| ManagerError::NoConnection(key.clone()))?;

        let conn = match &transport {
            Transport::V1(dialer) => dialer.dial(cancel).await?,
            Transport::V2(session) => session.open(cancel).await?,
        };
        debug!(key = %key, version = %transport.version(), "dialed logical connection");
        Ok((conn, transport.version()))
    }

    /// Closes every registered transport. Supervisors clean up the rest.
    pub fn shutdown(&self) {
        for (key, transport) in self.connections.all() {
            debug!(key = %key, "closing transport");
            transport.close();
        }
    }

    async fn supervise(
        self: Arc<Self>,
        key: DeviceKey,
        id: u64,
        transport: Transport,
        pinger: Pinger,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = transport.closed() => break "transport closed",
                _ = pinger.closed() => break "socket closed",
                _ = ticker.tick() => match pinger.ping(self.config.ping_timeout).await {
                    Ok(rtt) => {
                        trace!(key = %key, ?rtt, "liveness probe ok");
                        if let Some(cb) = &self.keep_alive {
                            cb(&key);
                        }
                    }
                    Err(e) => {
                        warn!(key = %key, version = %transport.version(), "liveness probe failed: {e}");
                        break "probe failed";
                    }
                },
            }
        };

        // A dead probe force-closes the transport, aborting any open streams.
        transport.close();
        pinger.close();
        self.connections.delete(&key, id);
        info!(key = %key, version = %transport.version(), reason, "transport terminated");

        if let Some(cb) = &self.terminate {
            cb(&key);
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("devices", &self.connections.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    type Events = Arc<Mutex<Vec<(&'static str, String)>>>;

    /// Server-side `WsConn` plus the agent's end of the socket.
    async fn ws_pair() -> (WsConn, WsConn) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (server, agent) = tokio::join!(
            WebSocketStream::from_raw_socket(a, Role::Server, None),
            WebSocketStream::from_raw_socket(b, Role::Client, None),
        );
        (WsConn::new(server), WsConn::new(agent))
    }

    /// A peer that never reads, so pings go unanswered.
    async fn silent_pair() -> (WsConn, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (server, agent) = tokio::join!(
            WebSocketStream::from_raw_socket(a, Role::Server, None),
            WebSocketStream::from_raw_socket(b, Role::Client, None),
        );
        (WsConn::new(server), agent)
    }

    fn manager(config: ManagerConfig) -> (Arc<Manager>, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let ka = events.clone();
        let term = events.clone();
        let m = Manager::new(DialerRegistry::new(), config)
            .on_keep_alive(move |k| ka.lock().unwrap().push(("keep-alive", k.to_string())))
            .on_terminate(move |k| term.lock().unwrap().push(("terminate", k.to_string())));
        (Arc::new(m), events)
    }

    fn count(events: &Events, kind: &str) -> usize {
        events.lock().unwrap().iter().filter(|(k, _)| *k == kind).count()
    }

    fn fast_probes() -> ManagerConfig {
        ManagerConfig {
            v1_probe_interval: Duration::from_millis(50),
            v2_ping_interval: Duration::from_millis(50),
            ping_timeout: Duration::from_millis(100),
            ..ManagerConfig::default()
        }
    }

    #[tokio::test]
    async fn dial_without_registration_fails_fast() {
        let (m, _events) = manager(ManagerConfig::default());
        let key: DeviceKey = "tenantB:dev9".parse().unwrap();

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            m.dial(&key, &CancellationToken::new()),
        )
        .await
        .expect("must not block");
        assert!(matches!(result, Err(ManagerError::NoConnection(k)) if k == key));
    }

    #[tokio::test]
    async fn bind_rejects_empty_identity() {
        let (m, _events) = manager(ManagerConfig::default());
        let (server, _agent) = ws_pair().await;
        assert!(matches!(
            m.bind("", "dev1", server),
            Err(ManagerError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn v2_dial_opens_stream() {
        let (m, _events) = manager(ManagerConfig::default());
        let (server, agent) = ws_pair().await;
        m.bind("tenantA", "dev1", server).unwrap();

        let agent_session = Session::server(agent, SessionConfig::default());
        let key: DeviceKey = "tenantA:dev1".parse().unwrap();
        let (mut conn, version) = m.dial(&key, &CancellationToken::new()).await.unwrap();
        assert_eq!(version, ConnVersion::V2);

        conn.write_all(b"hi").await.unwrap();
        let mut inbound = agent_session.accept().await.unwrap();
        let mut buf = [0u8; 2];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn v1_dial_goes_through_pickup() {
        use futures_util::StreamExt;
        use tokio_util::codec::{Framed, LinesCodec};

        let (m, _events) = manager(ManagerConfig::default());
        let (server, agent) = ws_pair().await;
        let key: DeviceKey = "tenantA:dev1".parse().unwrap();
        let dialer = m.set(key.clone(), server, "/ssh/revdial");
        assert!(m.registry().get(dialer.id()).is_some());

        let registry = m.registry().clone();
        tokio::spawn(async move {
            let mut lines = Framed::new(agent, LinesCodec::new());
            let mut peers = Vec::new();
            while let Some(Ok(line)) = lines.next().await {
                let msg = backhaul_protocol::ControlMessage::decode(&line).unwrap();
                if msg.command != backhaul_protocol::Command::ConnReady {
                    continue;
                }
                let query = msg.conn_path.split_once('?').unwrap().1;
                let q = backhaul_revdial::PickupQuery::parse(query).unwrap();
                let (conn, mut peer) = tokio::io::duplex(64);
                registry.pickup(&q.dialer, &q.uuid, Box::new(conn)).await.unwrap();
                peer.write_all(b"ok").await.unwrap();
                peers.push(peer);
            }
        });

        let (mut conn, version) = m.dial(&key, &CancellationToken::new()).await.unwrap();
        assert_eq!(version, ConnVersion::V1);
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn successful_probes_fire_keep_alive() {
        let (m, events) = manager(fast_probes());
        let (server, _agent) = ws_pair().await;
        m.bind("tenantA", "dev1", server).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(count(&events, "keep-alive") >= 2);
        assert_eq!(count(&events, "terminate"), 0);
    }

    #[tokio::test]
    async fn failed_ping_terminates_once_and_unregisters() {
        let (m, events) = manager(fast_probes());
        let (server, _silent) = silent_pair().await;
        let session = m.bind("tenantA", "dev1", server).unwrap();
        let key: DeviceKey = "tenantA:dev1".parse().unwrap();

        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("session should be force-closed");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count(&events, "terminate"), 1);
        assert!(m.connections().load(&key).is_none());
        assert!(matches!(
            m.dial(&key, &CancellationToken::new()).await,
            Err(ManagerError::NoConnection(_))
        ));
    }

    #[tokio::test]
    async fn agent_hangup_terminates_v1_transport() {
        let (m, events) = manager(ManagerConfig::default());
        let (server, agent) = ws_pair().await;
        let key: DeviceKey = "tenantA:dev1".parse().unwrap();
        let dialer = m.set(key.clone(), server, "/ssh/revdial");

        drop(agent);
        tokio::time::timeout(Duration::from_secs(2), dialer.closed())
            .await
            .expect("dialer should close");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count(&events, "terminate"), 1);
        assert!(m.registry().is_empty());
        assert!(m.connections().is_empty());
    }

    #[tokio::test]
    async fn stale_transport_does_not_evict_replacement() {
        let (m, events) = manager(ManagerConfig::default());
        let (old_server, _old_agent) = ws_pair().await;
        let (new_server, _new_agent) = ws_pair().await;
        let key: DeviceKey = "tenantA:dev1".parse().unwrap();

        let old = m.bind("tenantA", "dev1", old_server).unwrap();
        let new = m.bind("tenantA", "dev1", new_server).unwrap();
        assert_eq!(m.connections().count(&key), 2);

        old.close();
        tokio::time::timeout(Duration::from_secs(2), old.closed())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count(&events, "terminate"), 1);
        let Some(Transport::V2(current)) = m.connections().load(&key) else {
            panic!("replacement should remain");
        };
        assert!(Arc::ptr_eq(&current, &new));
    }
}
