//! Read pump: turns inbound frames into stream bytes and answers pings.

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::PendingPongs;

/// Reads frames until the socket closes, errors, or `cancel` fires.
///
/// Binary and text payloads go to `data_tx` in arrival order. Pongs
/// resolve the matching entry in `pongs`. The token is always cancelled
/// on exit so the write pump and any pinger observe the shutdown.
pub(crate) async fn read_pump<S>(
    mut read: S,
    data_tx: mpsc::Sender<Bytes>,
    pongs: PendingPongs,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = read.next() => msg,
        };

        let payload = match msg {
            Some(Ok(tungstenite::Message::Binary(data))) => data,
            Some(Ok(tungstenite::Message::Text(text))) => Bytes::copy_from_slice(text.as_bytes()),
            Some(Ok(tungstenite::Message::Ping(data))) => {
                trace!("received ping, sending pong");
                let _ = write_tx.try_send(tungstenite::Message::Pong(data));
                continue;
            }
            Some(Ok(tungstenite::Message::Pong(data))) => {
                resolve_pong(&pongs, &data);
                continue;
            }
            Some(Ok(tungstenite::Message::Close(frame))) => {
                debug!(?frame, "received close frame");
                break;
            }
            Some(Ok(tungstenite::Message::Frame(_))) => continue,
            Some(Err(e)) => {
                debug!("WebSocket read error: {e}");
                break;
            }
            None => {
                debug!("WebSocket stream ended");
                break;
            }
        };

        if payload.is_empty() {
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = data_tx.send(payload) => {
                if sent.is_err() {
                    // Reader side dropped.
                    break;
                }
            }
        }
    }

    cancel.cancel();
}

fn resolve_pong(pongs: &PendingPongs, data: &[u8]) {
    let Ok(seq) = <[u8; 8]>::try_from(data).map(u64::from_be_bytes) else {
        trace!(len = data.len(), "ignoring unsolicited pong");
        return;
    };
    let waiter = pongs.lock().ok().and_then(|mut p| p.remove(&seq));
    match waiter {
        Some(tx) => {
            let _ = tx.send(());
        }
        None => trace!(seq, "pong without waiter"),
    }
}
