//! v2 transport: one physical socket multiplexed into yamux streams.

use std::collections::VecDeque;
use std::task::Poll;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use backhaul_protocol::constants::{
    SESSION_ACCEPT_BACKLOG, SESSION_MAX_STREAMS, STREAM_IDLE_TIMEOUT, STREAM_OPEN_TIMEOUT,
};
use backhaul_revdial::BoxedConn;

use crate::error::SessionError;
use crate::idle::IdleStream;

/// How long a closing session waits for yamux to flush its goodbye.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type OpenReply = oneshot::Sender<Result<yamux::Stream, SessionError>>;

/// Tunables for a multiplexed session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_streams: usize,
    /// Inbound streams queued for [`Session::accept`]; extra ones are reset.
    pub accept_backlog: usize,
    pub open_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_streams: SESSION_MAX_STREAMS,
            accept_backlog: SESSION_ACCEPT_BACKLOG,
            open_timeout: STREAM_OPEN_TIMEOUT,
            idle_timeout: STREAM_IDLE_TIMEOUT,
        }
    }
}

/// A yamux session over one agent socket.
///
/// The server side runs it in client mode and only opens streams; the agent
/// runs it in server mode and accepts them. Streams are independent: closing
/// one never affects the others or the session.
pub struct Session {
    open_tx: mpsc::Sender<OpenReply>,
    inbound: Option<Mutex<mpsc::Receiver<yamux::Stream>>>,
    config: SessionConfig,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

impl Session {
    /// Opening side of a session.
    pub fn client<T>(io: T, config: SessionConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, yamux::Mode::Client, config, false)
    }

    /// Accepting side of a session.
    pub fn server<T>(io: T, config: SessionConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(io, yamux::Mode::Server, config, true)
    }

    fn start<T>(io: T, mode: yamux::Mode, config: SessionConfig, accepting: bool) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut cfg = yamux::Config::default();
        cfg.set_max_num_streams(config.max_streams);
        let conn = yamux::Connection::new(TokioAsyncReadCompatExt::compat(io), cfg, mode);

        let (open_tx, open_rx) = mpsc::channel(config.max_streams.max(1));
        let (inbound_tx, inbound) = if accepting {
            let (tx, rx) = mpsc::channel(config.accept_backlog.max(1));
            (Some(tx), Some(Mutex::new(rx)))
        } else {
            (None, None)
        };
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        tokio::spawn(drive(
            conn,
            open_rx,
            inbound_tx,
            shutdown.clone(),
            closed.clone(),
        ));

        Self {
            open_tx,
            inbound,
            config,
            shutdown,
            closed,
        }
    }

    /// Opens a new logical stream. No handshake is involved.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<BoxedConn, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = async {
            self.open_tx
                .send(reply_tx)
                .await
                .map_err(|_| SessionError::Closed)?;
            reply_rx.await.map_err(|_| SessionError::Closed)?
        };

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = self.closed.cancelled() => return Err(SessionError::Closed),
            opened = tokio::time::timeout(self.config.open_timeout, request) => {
                opened.map_err(|_| SessionError::OpenTimeout)??
            }
        };
        Ok(self.wrap(stream))
    }

    /// Waits for the next stream opened by the peer.
    pub async fn accept(&self) -> Result<BoxedConn, SessionError> {
        let inbound = self.inbound.as_ref().ok_or(SessionError::InboundDisabled)?;
        let mut rx = inbound.lock().await;
        tokio::select! {
            biased;
            stream = rx.recv() => match stream {
                Some(stream) => Ok(self.wrap(stream)),
                None => Err(SessionError::Closed),
            },
            _ = self.closed.cancelled() => Err(SessionError::Closed),
        }
    }

    fn wrap(&self, stream: yamux::Stream) -> BoxedConn {
        Box::new(IdleStream::new(
            FuturesAsyncReadCompatExt::compat(stream),
            self.config.idle_timeout,
        ))
    }

    /// Closes the session, resetting every open stream.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.closed.is_cancelled()
    }

    /// Resolves once the session driver has stopped.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("accepting", &self.inbound.is_some())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Polls the yamux connection: serves open requests, routes inbound
/// streams, and keeps frames moving for every live stream.
async fn drive<T>(
    mut conn: yamux::Connection<Compat<T>>,
    mut open_rx: mpsc::Receiver<OpenReply>,
    inbound_tx: Option<mpsc::Sender<yamux::Stream>>,
    shutdown: CancellationToken,
    closed: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut waiting: VecDeque<OpenReply> = VecDeque::new();
    let mut requests_open = true;

    let run = std::future::poll_fn(|cx| {
        while requests_open {
            match open_rx.poll_recv(cx) {
                Poll::Ready(Some(reply)) => waiting.push_back(reply),
                Poll::Ready(None) => requests_open = false,
                Poll::Pending => break,
            }
        }

        while let Some(front) = waiting.front() {
            if front.is_closed() {
                waiting.pop_front();
                continue;
            }
            match conn.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    trace!(stream = %stream.id(), "outbound stream opened");
                    if let Some(reply) = waiting.pop_front() {
                        let _ = reply.send(Ok(stream));
                    }
                }
                Poll::Ready(Err(yamux::ConnectionError::TooManyStreams)) => {
                    if let Some(reply) = waiting.pop_front() {
                        let _ = reply.send(Err(yamux::ConnectionError::TooManyStreams.into()));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }

        loop {
            match conn.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => match &inbound_tx {
                    Some(tx) => {
                        if tx.try_send(stream).is_err() {
                            warn!("inbound stream backlog full, resetting stream");
                        }
                    }
                    None => debug!(stream = %stream.id(), "rejecting inbound stream"),
                },
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => break,
            }
        }

        Poll::Pending
    });

    let result = tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        r = run => r,
    };
    match result {
        Ok(()) => debug!("session ended"),
        Err(e) => debug!("session failed: {e}"),
    }

    let _ = tokio::time::timeout(
        CLOSE_GRACE,
        std::future::poll_fn(|cx| conn.poll_close(cx)),
    )
    .await;
    closed.cancel();
}
