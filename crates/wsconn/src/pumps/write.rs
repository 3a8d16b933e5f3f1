//! Write pump: the only task that touches the socket's sink half.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use backhaul_protocol::constants::WS_WRITE_WAIT;

/// Drains queued frames onto the socket until cancelled or a write fails.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => {
                let Some(m) = msg else { break };
                match tokio::time::timeout(WS_WRITE_WAIT, write.send(m)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("WebSocket write error: {e}");
                        break;
                    }
                    Err(_) => {
                        warn!("WebSocket write timed out");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        write.send(tungstenite::Message::Close(None)),
    )
    .await;
}
