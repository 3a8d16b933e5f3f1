//! v1 reverse-dial transport.
//!
//! The agent keeps one outbound control socket open to the server. On the
//! server that socket is owned by a [`Dialer`]: each [`Dialer::dial`] asks
//! the agent, through a `conn-ready` control line, to open a fresh physical
//! connection back to a pick-up path. The HTTP layer hands that connection
//! to [`DialerRegistry::pickup`], which routes it to the waiting dial.
//!
//! On the agent the same socket is wrapped by a [`Listener`], which answers
//! `conn-ready` by dialing the pick-up path through a [`PickupDialer`] and
//! queues the result for [`Listener::accept`].

mod conn;
mod dialer;
mod error;
mod listener;
mod registry;

pub use conn::{BoxedConn, Conn};
pub use dialer::Dialer;
pub use error::RevdialError;
pub use listener::{Listener, ListenerConfig, PickupDialer, PickupFuture};
pub use registry::{DialerRegistry, PickupQuery};
