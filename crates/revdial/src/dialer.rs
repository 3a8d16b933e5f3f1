//! Server-side owner of an agent's v1 control socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use backhaul_protocol::constants::{
    KEEP_ALIVE_INTERVAL, MAX_CONTROL_LINE, PICKUP_DELIVER_TIMEOUT, WS_WRITE_WAIT,
};
use backhaul_protocol::{Command, ControlMessage};

use crate::conn::{BoxedConn, Conn};
use crate::error::RevdialError;
use crate::registry::DialerRegistry;

/// Dialer id length in bytes (32 hex characters).
const DIALER_ID_BYTES: usize = 16;

/// Buffered pick-up failures. Stale entries are drained by the next dial.
const FAILURE_QUEUE_SIZE: usize = 4;

type ControlSink = futures_util::stream::SplitSink<Framed<BoxedConn, LinesCodec>, String>;

/// The dial currently waiting for its pick-up connection.
struct Waiter {
    uuid: String,
    reply: oneshot::Sender<BoxedConn>,
}

struct PickupFailure {
    path: String,
    err: String,
}

/// Holding this lock is what makes a dial the single outstanding request.
struct Rendezvous {
    failures: mpsc::Receiver<PickupFailure>,
}

/// Requests new logical connections from an agent over its control socket.
pub struct Dialer {
    id: String,
    base_path: String,
    registry: Weak<DialerRegistry>,
    requests: mpsc::Sender<String>,
    waiter: StdMutex<Option<Waiter>>,
    waiter_ready: Notify,
    rendezvous: Mutex<Rendezvous>,
    done: CancellationToken,
    closed: AtomicBool,
}

impl Dialer {
    /// Takes ownership of `conn`, registers under a fresh id and starts the
    /// control loop. `base_path` is the pick-up path advertised to the agent.
    pub fn new<C>(conn: C, base_path: impl Into<String>, registry: &Arc<DialerRegistry>) -> Arc<Self>
    where
        C: Conn + 'static,
    {
        let (requests, requests_rx) = mpsc::channel(1);
        let (failures_tx, failures_rx) = mpsc::channel(FAILURE_QUEUE_SIZE);

        let dialer = Arc::new(Self {
            id: generate_id(),
            base_path: base_path.into(),
            registry: Arc::downgrade(registry),
            requests,
            waiter: StdMutex::new(None),
            waiter_ready: Notify::new(),
            rendezvous: Mutex::new(Rendezvous {
                failures: failures_rx,
            }),
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        registry.register(dialer.clone());
        debug!(dialer = %dialer.id, path = %dialer.base_path, "dialer registered");

        tokio::spawn(control_loop(
            dialer.clone(),
            Box::new(conn),
            requests_rx,
            failures_tx,
        ));
        dialer
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Pick-up path advertised for request `uuid`.
    pub fn pickup_path(&self, uuid: &str) -> String {
        format!("{}?dialer={}&uuid={}", self.base_path, self.id, uuid)
    }

    /// Asks the agent for one new logical connection and waits for it.
    ///
    /// Concurrent dials queue behind each other; closing the dialer wakes
    /// all of them with [`RevdialError::DialerClosed`].
    pub async fn dial(&self, cancel: &CancellationToken) -> Result<BoxedConn, RevdialError> {
        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RevdialError::Cancelled),
            _ = self.done.cancelled() => return Err(RevdialError::DialerClosed),
            guard = self.rendezvous.lock() => guard,
        };
        let rendezvous = &mut *guard;

        let uuid = uuid::Uuid::new_v4().to_string();
        let path = self.pickup_path(&uuid);
        let (reply, mut incoming) = oneshot::channel();
        let _waiting = self.wait_for(uuid.clone(), reply);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RevdialError::Cancelled),
            _ = self.done.cancelled() => return Err(RevdialError::DialerClosed),
            sent = self.requests.send(uuid.clone()) => {
                if sent.is_err() {
                    return Err(RevdialError::DialerClosed);
                }
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RevdialError::Cancelled),
                _ = self.done.cancelled() => return Err(RevdialError::DialerClosed),
                conn = &mut incoming => {
                    return conn.map_err(|_| RevdialError::DialerClosed);
                }
                failure = rendezvous.failures.recv() => match failure {
                    Some(f) if f.path == path => return Err(RevdialError::PickupFailed(f.err)),
                    Some(f) => {
                        debug!(dialer = %self.id, path = %f.path, "ignoring stale pick-up failure");
                    }
                    None => return Err(RevdialError::DialerClosed),
                },
            }
        }
    }

    /// Routes a picked-up connection to the dial waiting on `uuid`.
    ///
    /// A connection for another request is dropped at once. When no dial is
    /// waiting, one gets [`PICKUP_DELIVER_TIMEOUT`] to show up before the
    /// connection is dropped.
    pub async fn deliver(&self, uuid: String, conn: BoxedConn) -> Result<(), RevdialError> {
        let deadline = Instant::now() + PICKUP_DELIVER_TIMEOUT;
        loop {
            let ready = self.waiter_ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if self.done.is_cancelled() {
                return Err(RevdialError::DialerClosed);
            }
            let waiting = self.lock_waiter().take_if(|w| w.uuid == uuid);
            if let Some(waiter) = waiting {
                return waiter.reply.send(conn).map_err(|_| RevdialError::Cancelled);
            }
            if let Some(other) = self.lock_waiter().as_ref() {
                debug!(
                    dialer = %self.id,
                    uuid = %uuid,
                    waiting = %other.uuid,
                    "discarding unmatched pick-up"
                );
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = self.done.cancelled() => return Err(RevdialError::DialerClosed),
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(dialer = %self.id, uuid = %uuid, "nobody took the pick-up connection");
                    return Err(RevdialError::Timeout);
                }
                _ = &mut ready => {}
            }
        }
    }

    /// Publishes the dial waiting on `uuid` until the guard drops.
    fn wait_for(&self, uuid: String, reply: oneshot::Sender<BoxedConn>) -> WaiterGuard<'_> {
        *self.lock_waiter() = Some(Waiter {
            uuid: uuid.clone(),
            reply,
        });
        self.waiter_ready.notify_waiters();
        WaiterGuard { dialer: self, uuid }
    }

    fn lock_waiter(&self) -> MutexGuard<'_, Option<Waiter>> {
        self.waiter.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Unregisters the dialer and tears down the control socket. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        self.done.cancel();
        info!(dialer = %self.id, "dialer closed");
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the dialer has closed.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }
}

/// Clears the waiter slot when a dial returns or is dropped.
struct WaiterGuard<'a> {
    dialer: &'a Dialer,
    uuid: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.dialer.lock_waiter().take_if(|w| w.uuid == self.uuid);
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("id", &self.id)
            .field("base_path", &self.base_path)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn generate_id() -> String {
    let mut bytes = [0u8; DIALER_ID_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Writes one control line. Returns early without error once `done` fires.
async fn send_control(
    sink: &mut ControlSink,
    msg: &ControlMessage,
    done: &CancellationToken,
) -> Result<(), RevdialError> {
    let line = msg.encode()?;
    tokio::select! {
        biased;
        _ = done.cancelled() => Ok(()),
        sent = tokio::time::timeout(WS_WRITE_WAIT, sink.send(line)) => {
            sent.map_err(|_| RevdialError::Timeout)??;
            Ok(())
        }
    }
}

async fn control_loop(
    dialer: Arc<Dialer>,
    conn: BoxedConn,
    mut requests: mpsc::Receiver<String>,
    failures: mpsc::Sender<PickupFailure>,
) {
    let framed = Framed::new(conn, LinesCodec::new_with_max_length(MAX_CONTROL_LINE));
    let (mut sink, mut lines) = framed.split();

    let mut keep_alive =
        tokio::time::interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result: Result<(), RevdialError> = loop {
        tokio::select! {
            _ = dialer.done.cancelled() => break Ok(()),

            _ = keep_alive.tick() => {
                trace!(dialer = %dialer.id, "sending keep-alive");
                if let Err(e) = send_control(&mut sink, &ControlMessage::keep_alive(), &dialer.done).await {
                    break Err(e);
                }
            }

            req = requests.recv() => {
                let Some(uuid) = req else { break Ok(()) };
                let msg = ControlMessage::conn_ready(dialer.pickup_path(&uuid));
                if let Err(e) = send_control(&mut sink, &msg, &dialer.done).await {
                    break Err(e);
                }
                keep_alive.reset();
            }

            line = lines.next() => {
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => break Err(e.into()),
                    None => break Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into()),
                };
                let msg = match ControlMessage::decode(&line) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(dialer = %dialer.id, "malformed control message: {e}");
                        break Err(e.into());
                    }
                };
                match msg.command {
                    Command::KeepAlive => trace!(dialer = %dialer.id, "keep-alive received"),
                    Command::PickupFailed => {
                        warn!(dialer = %dialer.id, path = %msg.conn_path, err = %msg.err, "pick-up failed");
                        let _ = failures.try_send(PickupFailure {
                            path: msg.conn_path,
                            err: msg.err,
                        });
                    }
                    other => debug!(dialer = %dialer.id, ?other, "ignoring control command"),
                }
            }
        }
    };

    if let Err(e) = result {
        debug!(dialer = %dialer.id, "control loop ended: {e}");
    }
    dialer.close();
}
