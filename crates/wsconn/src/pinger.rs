use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use crate::WsConnError;
use crate::pumps::PendingPongs;

/// Liveness probe sharing a [`WsConn`](crate::WsConn)'s write pump.
///
/// Cloning is cheap. A pinger outlives the connection it was taken from
/// and reports [`WsConnError::Closed`] once the socket is gone.
#[derive(Clone)]
pub struct Pinger {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pongs: PendingPongs,
    seq: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Pinger {
    pub(crate) fn new(
        write_tx: mpsc::Sender<tungstenite::Message>,
        pongs: PendingPongs,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            write_tx,
            pongs,
            seq: Arc::new(AtomicU64::new(1)),
            cancel,
        }
    }

    /// Sends a ping and waits for its pong, returning the round-trip time.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, WsConnError> {
        if self.cancel.is_cancelled() {
            return Err(WsConnError::Closed);
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pongs) = self.pongs.lock() {
            pongs.insert(seq, tx);
        }

        let started = Instant::now();
        let frame = tungstenite::Message::Ping(Bytes::copy_from_slice(&seq.to_be_bytes()));
        let round_trip = async {
            self.write_tx
                .send(frame)
                .await
                .map_err(|_| WsConnError::Closed)?;
            rx.await.map_err(|_| WsConnError::Closed)
        };

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(WsConnError::Closed),
            r = tokio::time::timeout(timeout, round_trip) => match r {
                Ok(Ok(())) => Ok(started.elapsed()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(WsConnError::PingTimeout),
            },
        };

        if let Ok(mut pongs) = self.pongs.lock() {
            pongs.remove(&seq);
        }
        result
    }

    /// Resolves once the underlying socket has shut down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tears down the underlying socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Pinger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pinger")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
