use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::trace;

use crate::pinger::Pinger;
use crate::pumps::{PendingPongs, read, write};
use crate::{MAX_FRAME_PAYLOAD, READ_QUEUE_SIZE, WRITE_QUEUE_SIZE};

/// A WebSocket connection presented as a byte stream.
///
/// Writes become binary frames (split at [`MAX_FRAME_PAYLOAD`]); reads
/// yield frame payloads back to back. Shutting down the write half sends
/// a close frame, after which the peer's acknowledgement ends the read
/// half. Dropping the value tears the socket down.
pub struct WsConn {
    data_rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
    write_tx: PollSender<tungstenite::Message>,
    pinger: Pinger,
    cancel: CancellationToken,
}

impl WsConn {
    /// Takes ownership of an established WebSocket and starts its pumps.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_SIZE);
        let (data_tx, data_rx) = mpsc::channel(READ_QUEUE_SIZE);
        let pongs: PendingPongs = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(write::write_pump(sink, write_rx, cancel.clone()));
        tokio::spawn(read::read_pump(
            stream,
            data_tx,
            pongs.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));

        let pinger = Pinger::new(write_tx.clone(), pongs, cancel.clone());
        Self {
            data_rx,
            pending: Bytes::new(),
            write_tx: PollSender::new(write_tx),
            pinger,
            cancel,
        }
    }

    /// Returns a liveness probe bound to this connection.
    pub fn pinger(&self) -> Pinger {
        self.pinger.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tears down the socket without waiting for the peer.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WsConn {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for WsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConn")
            .field("buffered", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
}

impl AsyncRead for WsConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(this.data_rx.poll_recv(cx)) {
                Some(data) => this.pending = data,
                // Read pump gone: EOF.
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for WsConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.cancel.is_cancelled() {
            return Poll::Ready(Err(closed_error()));
        }

        ready!(this.write_tx.poll_reserve(cx)).map_err(|_| closed_error())?;
        let n = data.len().min(MAX_FRAME_PAYLOAD);
        this.write_tx
            .send_item(tungstenite::Message::Binary(Bytes::copy_from_slice(
                &data[..n],
            )))
            .map_err(|_| closed_error())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the write pump as soon as they are queued.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_tx.is_closed() || this.cancel.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        if ready!(this.write_tx.poll_reserve(cx)).is_ok() {
            trace!("write half shut down, sending close frame");
            let _ = this.write_tx.send_item(tungstenite::Message::Close(None));
        }
        this.write_tx.close();
        Poll::Ready(Ok(()))
    }
}
