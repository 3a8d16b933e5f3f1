use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream that can be handed across tasks.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Conn for T {}

/// Type-erased logical connection returned by dials and accepts.
pub type BoxedConn = Box<dyn Conn>;
