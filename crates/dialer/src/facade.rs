use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use backhaul_connman::{Manager, ManagerConfig, ManagerError, Session};
use backhaul_protocol::DeviceKey;
use backhaul_revdial::{BoxedConn, DialerRegistry};
use backhaul_throttle::{Limit, ThrottleError, ThrottleHandle, Throttler};
use backhaul_wsconn::WsConn;

use crate::error::DialError;
use crate::lifecycle::DeviceLifecycle;
use crate::target::Target;

/// A prepared logical connection with live-adjustable rate limits.
pub type DialedConn = Throttler<BoxedConn>;

/// Limits applied to every connection returned by [`Dialer::dial_to`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub read: Limit,
    pub write: Limit,
}

impl ThrottleConfig {
    /// Rejects negative rates or bursts in either direction.
    pub fn validate(&self) -> Result<(), ThrottleError> {
        self.read.validate()?;
        self.write.validate()
    }
}

/// Ties the connection manager to the device lifecycle and exposes
/// [`dial_to`](Self::dial_to).
pub struct Dialer {
    manager: Arc<Manager>,
    throttle: ThrottleConfig,
}

impl Dialer {
    /// Fails with [`DialError::Throttle`] when `throttle` holds negative limits.
    pub fn new(
        registry: Arc<DialerRegistry>,
        config: ManagerConfig,
        lifecycle: Arc<dyn DeviceLifecycle>,
        throttle: ThrottleConfig,
    ) -> Result<Self, DialError> {
        throttle.validate()?;
        let on_heartbeat = lifecycle.clone();
        let on_offline = lifecycle;

        let manager = Manager::new(registry, config)
            .on_keep_alive(move |key| {
                let lifecycle = on_heartbeat.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    if let Err(e) = lifecycle.heartbeat(&key).await {
                        warn!(key = %key, "heartbeat update failed: {e}");
                    }
                });
            })
            .on_terminate(move |key| {
                let lifecycle = on_offline.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    if let Err(e) = lifecycle.mark_offline(&key).await {
                        warn!(key = %key, "offline update failed: {e}");
                    }
                });
            });

        Ok(Self {
            manager: Arc::new(manager),
            throttle,
        })
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Registers a v1 control socket. See [`Manager::set`].
    pub fn set(&self, key: DeviceKey, conn: WsConn, pickup_path: &str) {
        self.manager.set(key, conn, pickup_path);
    }

    /// Registers a v2 socket. See [`Manager::bind`].
    pub fn bind(&self, tenant: &str, device: &str, conn: WsConn) -> Result<Arc<Session>, DialError> {
        Ok(self.manager.bind(tenant, device, conn)?)
    }

    /// Opens a connection to `device` of `tenant` prepared for `target`.
    ///
    /// Fails immediately when the device has no transport. Handshake
    /// failures are returned as is; nothing is retried.
    pub async fn dial_to(
        &self,
        tenant: &str,
        device: &str,
        target: &dyn Target,
        cancel: &CancellationToken,
    ) -> Result<DialedConn, DialError> {
        let key = DeviceKey::new(tenant, device).map_err(ManagerError::from)?;
        let (conn, version) = self.manager.dial(&key, cancel).await?;

        if !target.supports(version) {
            return Err(DialError::UnsupportedVersion {
                target: target.name(),
                version,
            });
        }

        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
            prepared = target.prepare(conn, version) => prepared.map_err(|source| {
                DialError::Negotiation {
                    target: target.name(),
                    version,
                    source,
                }
            })?,
        };
        debug!(key = %key, target = target.name(), version = %version, "connection ready");

        let limits = ThrottleHandle::new(self.throttle.read, self.throttle.write)?;
        Ok(Throttler::new(conn, limits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LifecycleFuture, TracingLifecycle};
    use crate::target::SshOpenTarget;
    use backhaul_connman::SessionConfig;
    use backhaul_protocol::constants::{PROTO_HTTP_PROXY, PROTO_SSH_CLOSE, PROTO_SSH_OPEN};
    use backhaul_protocol::headers::read_json_line;
    use backhaul_protocol::multistream::negotiate;
    use backhaul_protocol::{ConnVersion, SessionHeader};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl DeviceLifecycle for Recorder {
        fn heartbeat<'a>(&'a self, device: &'a DeviceKey) -> LifecycleFuture<'a> {
            Box::pin(async move {
                self.events.lock().unwrap().push(format!("heartbeat {device}"));
                Ok(())
            })
        }

        fn mark_offline<'a>(&'a self, device: &'a DeviceKey) -> LifecycleFuture<'a> {
            Box::pin(async move {
                self.events.lock().unwrap().push(format!("offline {device}"));
                Ok(())
            })
        }
    }

    async fn ws_pair() -> (WsConn, WsConn) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (server, agent) = tokio::join!(
            WebSocketStream::from_raw_socket(a, Role::Server, None),
            WebSocketStream::from_raw_socket(b, Role::Client, None),
        );
        (WsConn::new(server), WsConn::new(agent))
    }

    fn dialer(lifecycle: Arc<dyn DeviceLifecycle>, config: ManagerConfig) -> Dialer {
        Dialer::new(DialerRegistry::new(), config, lifecycle, ThrottleConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn ssh_open_over_v2_negotiates_before_payload() {
        let d = dialer(Arc::new(TracingLifecycle), ManagerConfig::default());
        let (server, agent) = ws_pair().await;
        d.bind("tenantA", "dev1", server).unwrap();

        let agent_session = Session::server(agent, SessionConfig::default());
        let agent_side = tokio::spawn(async move {
            let mut stream = agent_session.accept().await.unwrap();
            let proto = negotiate(&mut stream, &[PROTO_SSH_OPEN, PROTO_SSH_CLOSE, PROTO_HTTP_PROXY])
                .await
                .unwrap();
            let header: SessionHeader = read_json_line(&mut stream).await.unwrap();
            let mut payload = [0u8; 5];
            stream.read_exact(&mut payload).await.unwrap();
            (proto, header, payload, agent_session)
        });

        let mut conn = d
            .dial_to("tenantA", "dev1", &SshOpenTarget::new("abc"), &CancellationToken::new())
            .await
            .unwrap();
        conn.write_all(b"hello").await.unwrap();

        let (proto, header, payload, _session) = agent_side.await.unwrap();
        assert_eq!(proto, PROTO_SSH_OPEN);
        assert_eq!(header, SessionHeader { id: "abc".into() });
        assert_eq!(&payload, b"hello");
    }

    #[tokio::test]
    async fn unknown_device_reports_no_connection() {
        let d = dialer(Arc::new(TracingLifecycle), ManagerConfig::default());
        let result = tokio::time::timeout(
            Duration::from_millis(100),
            d.dial_to("tenantB", "dev9", &SshOpenTarget::new("x"), &CancellationToken::new()),
        )
        .await
        .expect("must not block");

        let Err(err) = result else {
            panic!("dial should fail");
        };
        assert!(err.is_no_connection());
    }

    #[tokio::test]
    async fn failed_negotiation_names_target_and_version() {
        let d = dialer(Arc::new(TracingLifecycle), ManagerConfig::default());
        let (server, agent) = ws_pair().await;
        d.bind("tenantA", "dev1", server).unwrap();

        let agent_session = Session::server(agent, SessionConfig::default());
        tokio::spawn(async move {
            let mut stream = agent_session.accept().await.unwrap();
            let _ = negotiate(&mut stream, &[PROTO_HTTP_PROXY]).await;
            agent_session
        });

        let result = d
            .dial_to("tenantA", "dev1", &SshOpenTarget::new("abc"), &CancellationToken::new())
            .await;
        let Err(err) = result else {
            panic!("negotiation should fail");
        };
        assert!(matches!(
            err,
            DialError::Negotiation {
                target: "ssh-open",
                version: ConnVersion::V2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn dialed_connections_carry_configured_limits() {
        let limit = Limit::new(4096, 1024);
        let d = Dialer::new(
            DialerRegistry::new(),
            ManagerConfig::default(),
            Arc::new(TracingLifecycle),
            ThrottleConfig {
                read: Limit::unlimited(),
                write: limit,
            },
        )
        .unwrap();
        let (server, agent) = ws_pair().await;
        d.bind("tenantA", "dev1", server).unwrap();
        let agent_session = Session::server(agent, SessionConfig::default());
        tokio::spawn(async move {
            let mut stream = agent_session.accept().await.unwrap();
            let _ = negotiate(&mut stream, &[PROTO_SSH_OPEN]).await;
            let _: Result<SessionHeader, _> = read_json_line(&mut stream).await;
            agent_session
        });

        let conn = d
            .dial_to("tenantA", "dev1", &SshOpenTarget::new("abc"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(conn.handle().write_limit(), Some(limit));
        assert_eq!(conn.handle().read_limit(), None);
    }

    #[test]
    fn negative_throttle_config_is_rejected() {
        let result = Dialer::new(
            DialerRegistry::new(),
            ManagerConfig::default(),
            Arc::new(TracingLifecycle),
            ThrottleConfig {
                read: Limit::new(-100, 10),
                write: Limit::unlimited(),
            },
        );
        assert!(matches!(
            result,
            Err(DialError::Throttle(ThrottleError::InvalidLimit { rate: -100, burst: 10 }))
        ));
    }

    #[tokio::test]
    async fn liveness_drives_lifecycle() {
        let recorder = Arc::new(Recorder::default());
        let config = ManagerConfig {
            v2_ping_interval: Duration::from_millis(30),
            ping_timeout: Duration::from_millis(200),
            ..ManagerConfig::default()
        };
        let d = dialer(recorder.clone(), config);
        let (server, agent) = ws_pair().await;
        d.bind("tenantA", "dev1", server).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        drop(agent);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let events = recorder.events.lock().unwrap().clone();
        assert!(events.iter().any(|e| e == "heartbeat tenantA:dev1"));
        assert_eq!(
            events.iter().filter(|e| *e == "offline tenantA:dev1").count(),
            1
        );
    }
}
