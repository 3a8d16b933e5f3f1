//! Agent-side end of the v1 control socket.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use backhaul_protocol::constants::{
    KEEP_ALIVE_INTERVAL, LISTENER_IDLE_TIMEOUT, MAX_CONTROL_LINE, WS_WRITE_WAIT,
};
use backhaul_protocol::{Command, ControlMessage};

use crate::conn::{BoxedConn, Conn};
use crate::error::RevdialError;

type ControlFramed = Framed<BoxedConn, LinesCodec>;

/// Outgoing control messages queued for the write loop.
const OUTBOX_SIZE: usize = 16;

/// Boxed future returned by [`PickupDialer::dial`].
pub type PickupFuture<'a> =
    Pin<Box<dyn Future<Output = Result<BoxedConn, RevdialError>> + Send + 'a>>;

/// Opens the physical connection for a pick-up.
///
/// `path` is the `connPath` advertised by the server, query included. The
/// implementation must perform the upgrade handshake and fail unless the
/// server switched protocols.
pub trait PickupDialer: Send + Sync + 'static {
    fn dial<'a>(&'a self, path: &'a str) -> PickupFuture<'a>;
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Close the listener when no control message arrives for this long.
    pub idle_timeout: Duration,
    pub keep_alive_interval: Duration,
    /// Picked-up connections waiting for [`Listener::accept`].
    pub accept_backlog: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: LISTENER_IDLE_TIMEOUT,
            keep_alive_interval: KEEP_ALIVE_INTERVAL,
            accept_backlog: 8,
        }
    }
}

/// Accepts logical connections the server requests over a control socket.
///
/// Runs a write loop, a read loop and a heartbeat loop against the socket.
/// Any of them failing, or the idle timeout expiring, closes the listener.
pub struct Listener {
    accept_rx: Mutex<mpsc::Receiver<BoxedConn>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Listener {
    pub fn new<C>(conn: C, dialer: Arc<dyn PickupDialer>) -> Self
    where
        C: Conn + 'static,
    {
        Self::with_config(conn, dialer, ListenerConfig::default())
    }

    pub fn with_config<C>(conn: C, dialer: Arc<dyn PickupDialer>, config: ListenerConfig) -> Self
    where
        C: Conn + 'static,
    {
        let conn: BoxedConn = Box::new(conn);
        let (sink, lines) =
            Framed::new(conn, LinesCodec::new_with_max_length(MAX_CONTROL_LINE)).split();
        let (out_tx, out_rx) = mpsc::channel(OUTBOX_SIZE);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let cancel = CancellationToken::new();

        tokio::spawn(write_loop(sink, out_rx, cancel.clone()));
        tokio::spawn(heartbeat_loop(
            out_tx.clone(),
            config.keep_alive_interval,
            cancel.clone(),
        ));
        tokio::spawn(read_loop(
            lines,
            Pickups {
                dialer,
                out_tx,
                accept_tx,
                cancel: cancel.clone(),
            },
            config.idle_timeout,
        ));

        Self {
            accept_rx: Mutex::new(accept_rx),
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    /// Waits for the next picked-up connection.
    pub async fn accept(&self) -> Result<BoxedConn, RevdialError> {
        let mut rx = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RevdialError::ListenerClosed),
            rx = self.accept_rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RevdialError::ListenerClosed),
            conn = rx.recv() => conn.ok_or(RevdialError::ListenerClosed),
        }
    }

    /// Closes the control socket and all loops. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        info!("listener closed");
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the listener has shut down for any reason.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn write_loop(
    mut sink: SplitSink<ControlFramed, String>,
    mut out_rx: mpsc::Receiver<ControlMessage>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = out_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let line = match msg.encode() {
            Ok(line) => line,
            Err(e) => {
                warn!("dropping unencodable control message: {e}");
                continue;
            }
        };
        match tokio::time::timeout(WS_WRITE_WAIT, sink.send(line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("control write error: {e}");
                break;
            }
            Err(_) => {
                warn!("control write timed out");
                break;
            }
        }
    }
    cancel.cancel();
}

async fn heartbeat_loop(
    out_tx: mpsc::Sender<ControlMessage>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                trace!("sending keep-alive");
                if out_tx.send(ControlMessage::keep_alive()).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// What the read loop needs to serve `conn-ready` requests.
#[derive(Clone)]
struct Pickups {
    dialer: Arc<dyn PickupDialer>,
    out_tx: mpsc::Sender<ControlMessage>,
    accept_tx: mpsc::Sender<BoxedConn>,
    cancel: CancellationToken,
}

async fn read_loop(mut lines: SplitStream<ControlFramed>, pickups: Pickups, idle_timeout: Duration) {
    let cancel = pickups.cancel.clone();
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            () = &mut idle => {
                warn!(timeout = ?idle_timeout, "no control traffic, closing listener");
                break;
            }
            line = lines.next() => line,
        };

        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                debug!("control read error: {e}");
                break;
            }
            None => {
                debug!("control socket closed");
                break;
            }
        };
        idle.as_mut().reset(Instant::now() + idle_timeout);

        let msg = match ControlMessage::decode(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("malformed control message: {e}");
                break;
            }
        };
        match msg.command {
            Command::KeepAlive => trace!("keep-alive received"),
            Command::ConnReady => {
                tokio::spawn(pickup(pickups.clone(), msg.conn_path));
            }
            other => debug!(?other, "ignoring control command"),
        }
    }

    cancel.cancel();
}

async fn pickup(pickups: Pickups, path: String) {
    let dialed = tokio::select! {
        _ = pickups.cancel.cancelled() => return,
        dialed = pickups.dialer.dial(&path) => dialed,
    };

    match dialed {
        Ok(conn) => {
            trace!(path = %path, "picked up connection");
            tokio::select! {
                _ = pickups.cancel.cancelled() => {}
                sent = pickups.accept_tx.send(conn) => {
                    if sent.is_err() {
                        debug!(path = %path, "accept queue gone, dropping connection");
                    }
                }
            }
        }
        Err(e) => {
            warn!(path = %path, "pick-up failed: {e}");
            let _ = pickups
                .out_tx
                .send(ControlMessage::pickup_failed(path, e.to_string()))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    type ServerSide = Framed<DuplexStream, LinesCodec>;

    struct Loopback {
        peers: mpsc::UnboundedSender<(String, DuplexStream)>,
    }

    impl PickupDialer for Loopback {
        fn dial<'a>(&'a self, path: &'a str) -> PickupFuture<'a> {
            Box::pin(async move {
                let (ours, theirs) = tokio::io::duplex(1024);
                let _ = self.peers.send((path.to_string(), theirs));
                Ok(Box::new(ours) as BoxedConn)
            })
        }
    }

    struct Refuse;

    impl PickupDialer for Refuse {
        fn dial<'a>(&'a self, _path: &'a str) -> PickupFuture<'a> {
            Box::pin(async { Err(RevdialError::BadStatus(404)) })
        }
    }

    fn listen(dialer: Arc<dyn PickupDialer>) -> (Listener, ServerSide) {
        let (agent_io, server_io) = tokio::io::duplex(64 * 1024);
        let listener = Listener::new(agent_io, dialer);
        (listener, Framed::new(server_io, LinesCodec::new()))
    }

    async fn send(server: &mut ServerSide, msg: ControlMessage) {
        server.send(msg.encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn conn_ready_yields_accepted_connection() {
        let (peers_tx, mut peers_rx) = mpsc::unbounded_channel();
        let (listener, mut server) = listen(Arc::new(Loopback { peers: peers_tx }));

        let path = "/ssh/revdial?dialer=d1&uuid=u1";
        send(&mut server, ControlMessage::conn_ready(path)).await;

        let mut conn = listener.accept().await.unwrap();
        let (dialed_path, mut peer) = peers_rx.recv().await.unwrap();
        assert_eq!(dialed_path, path);

        conn.write_all(b"GET /ssh/abc HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET");
    }

    #[tokio::test]
    async fn failed_pickup_is_reported_back() {
        let (_listener, mut server) = listen(Arc::new(Refuse));
        let path = "/ssh/revdial?dialer=d1&uuid=u2";
        send(&mut server, ControlMessage::conn_ready(path)).await;

        let line = server.next().await.unwrap().unwrap();
        let msg = ControlMessage::decode(&line).unwrap();
        assert_eq!(msg.command, Command::PickupFailed);
        assert_eq!(msg.conn_path, path);
        assert!(msg.err.contains("404"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_listener_closes_itself() {
        let (listener, _server) = listen(Arc::new(Refuse));
        let started = Instant::now();

        assert!(matches!(
            listener.accept().await,
            Err(RevdialError::ListenerClosed)
        ));
        assert!(started.elapsed() >= LISTENER_IDLE_TIMEOUT);
        assert!(matches!(
            listener.accept().await,
            Err(RevdialError::ListenerClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_holds_listener_open() {
        let (listener, mut server) = listen(Arc::new(Refuse));

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            send(&mut server, ControlMessage::keep_alive()).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!listener.is_closed());

        tokio::time::sleep(LISTENER_IDLE_TIMEOUT).await;
        assert!(listener.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_sends_keep_alive() {
        let (_listener, mut server) = listen(Arc::new(Refuse));
        tokio::time::sleep(KEEP_ALIVE_INTERVAL + Duration::from_millis(5)).await;

        let line = server.next().await.unwrap().unwrap();
        assert_eq!(
            ControlMessage::decode(&line).unwrap().command,
            Command::KeepAlive
        );
    }

    #[tokio::test]
    async fn malformed_message_closes_listener() {
        let (listener, mut server) = listen(Arc::new(Refuse));
        server.send("{broken".to_string()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), listener.closed())
            .await
            .expect("listener should close");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let listener = Arc::new(listen(Arc::new(Refuse)).0);
        let closers: Vec<_> = (0..4)
            .map(|_| {
                let l = listener.clone();
                tokio::spawn(async move { l.close() })
            })
            .collect();
        for c in closers {
            c.await.unwrap();
        }
        listener.close();
        assert!(matches!(
            listener.accept().await,
            Err(RevdialError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn server_hangup_closes_listener() {
        let (listener, server) = listen(Arc::new(Refuse));
        drop(server);
        assert!(matches!(
            listener.accept().await,
            Err(RevdialError::ListenerClosed)
        ));
    }
}
