//! Rate-limited stream wrapper.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;

use crate::ThrottleError;
use crate::bucket::{Bucket, Limit};

type Slot = Arc<RwLock<Option<Arc<Bucket>>>>;

/// Shared, hot-swappable read and write limits.
///
/// Clones refer to the same limits. Each direction has its own lock, so
/// updating one never stalls traffic on the other.
#[derive(Clone, Default)]
pub struct ThrottleHandle {
    read: Slot,
    write: Slot,
}

impl ThrottleHandle {
    /// Creates limits from an initial configuration.
    ///
    /// A zero rate leaves that direction unlimited and a zero burst with a
    /// positive rate admits one second of traffic at once. Negative values
    /// are rejected.
    pub fn new(read: Limit, write: Limit) -> Result<Self, ThrottleError> {
        read.validate()?;
        write.validate()?;
        Ok(Self {
            read: Arc::new(RwLock::new(initial_bucket(read))),
            write: Arc::new(RwLock::new(initial_bucket(write))),
        })
    }

    /// Replaces the read limit. Negative values are rejected and leave
    /// the current limit in place; a zero rate removes the limit.
    pub fn update_read_limit(&self, limit: Limit) -> Result<(), ThrottleError> {
        update(&self.read, limit)?;
        tracing::debug!(rate = limit.rate, burst = limit.burst, "read limit updated");
        Ok(())
    }

    /// Replaces the write limit. Same rules as [`update_read_limit`](Self::update_read_limit).
    pub fn update_write_limit(&self, limit: Limit) -> Result<(), ThrottleError> {
        update(&self.write, limit)?;
        tracing::debug!(rate = limit.rate, burst = limit.burst, "write limit updated");
        Ok(())
    }

    /// Current read limit, `None` when unlimited.
    pub fn read_limit(&self) -> Option<Limit> {
        current(&self.read).map(|b| b.limit())
    }

    /// Current write limit, `None` when unlimited.
    pub fn write_limit(&self) -> Option<Limit> {
        current(&self.write).map(|b| b.limit())
    }

    fn read_bucket(&self) -> Option<Arc<Bucket>> {
        current(&self.read)
    }

    fn write_bucket(&self) -> Option<Arc<Bucket>> {
        current(&self.write)
    }
}

fn initial_bucket(limit: Limit) -> Option<Arc<Bucket>> {
    if limit.is_unlimited() {
        return None;
    }
    // A missing burst admits one second worth of traffic at once.
    let burst = if limit.burst > 0 { limit.burst } else { limit.rate };
    Some(Arc::new(Bucket::new(Limit::new(limit.rate, burst))))
}

fn update(slot: &Slot, limit: Limit) -> Result<(), ThrottleError> {
    limit.validate()?;
    let bucket = if limit.rate == 0 {
        None
    } else if limit.burst == 0 {
        return Err(ThrottleError::ZeroBurst);
    } else {
        Some(Arc::new(Bucket::new(limit)))
    };
    *slot.write().unwrap_or_else(|e| e.into_inner()) = bucket;
    Ok(())
}

fn current(slot: &Slot) -> Option<Arc<Bucket>> {
    slot.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Tokens reserved for one chunk, plus the wait before they may be used.
struct Grant {
    len: usize,
    wait: Option<Pin<Box<Sleep>>>,
}

impl Grant {
    fn reserve(bucket: &Bucket, want: usize) -> Self {
        let len = want.min(bucket.burst());
        let delay = bucket.reserve(len);
        let wait = (!delay.is_zero()).then(|| Box::pin(tokio::time::sleep(delay)));
        Self { len, wait }
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(wait) = self.wait.as_mut() {
            ready!(wait.as_mut().poll(cx));
            self.wait = None;
        }
        Poll::Ready(())
    }
}

/// Stream wrapper enforcing the limits of a [`ThrottleHandle`].
///
/// Each read or write is cut to at most `burst` bytes and waits until the
/// bucket admits that chunk before touching the inner stream, so a single
/// call may transfer fewer bytes than requested. `write_all` and friends
/// loop over the remainder. Unlimited directions pass straight through.
///
/// Everything besides byte transfer (flush, shutdown, addresses) goes to
/// the inner stream unchanged.
pub struct Throttler<S> {
    inner: S,
    limits: ThrottleHandle,
    read_grant: Option<Grant>,
    write_grant: Option<Grant>,
}

impl<S> Throttler<S> {
    pub fn new(inner: S, limits: ThrottleHandle) -> Self {
        Self {
            inner,
            limits,
            read_grant: None,
            write_grant: None,
        }
    }

    /// Handle for changing this stream's limits while it is in use.
    pub fn handle(&self) -> ThrottleHandle {
        self.limits.clone()
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl Throttler<TcpStream> {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Throttler<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let Some(bucket) = this.limits.read_bucket() else {
            this.read_grant = None;
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        };
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let grant = this
            .read_grant
            .get_or_insert_with(|| Grant::reserve(&bucket, buf.remaining()));
        ready!(grant.poll_ready(cx));

        let len = grant.len.min(buf.remaining());
        let mut chunk = ReadBuf::new(buf.initialize_unfilled_to(len));
        let result = ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk));
        let n = chunk.filled().len();
        buf.advance(n);
        this.read_grant = None;
        Poll::Ready(result)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Throttler<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let Some(bucket) = this.limits.write_bucket() else {
            this.write_grant = None;
            return Pin::new(&mut this.inner).poll_write(cx, data);
        };
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let grant = this
            .write_grant
            .get_or_insert_with(|| Grant::reserve(&bucket, data.len()));
        ready!(grant.poll_ready(cx));

        let len = grant.len.min(data.len());
        let result = ready!(Pin::new(&mut this.inner).poll_write(cx, &data[..len]));
        this.write_grant = None;
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
