//! Device-side runtime for the reverse-dial transport.
//!
//! The agent dials out to the tunnel server, registers under its tenant and
//! device id, and then serves the logical connections the server opens back
//! through that socket. Requests are dispatched to a [`Handler`]; the
//! shipped [`ForwardHandler`] bridges them to local TCP services.

mod config;
mod dispatch;
mod error;
mod forward;
mod handler;
mod pickup;
mod runtime;

pub use config::{AgentConfig, ReconnectConfig};
pub use error::AgentError;
pub use forward::ForwardHandler;
pub use handler::{ConnectFuture, Handler, HandlerFuture};
pub use pickup::WsPickupDialer;
pub use runtime::Agent;
