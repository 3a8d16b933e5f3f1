//! Connection manager.
//!
//! Keeps the transports agents have registered, keyed by [`DeviceKey`],
//! and dials new logical connections out of them. A v1 transport is a
//! [`Dialer`](backhaul_revdial::Dialer) doing pick-up handshakes; a v2
//! transport is a multiplexed [`Session`] opening yamux streams.
//!
//! [`DeviceKey`]: backhaul_protocol::DeviceKey

mod connections;
mod error;
mod idle;
mod manager;
mod session;

pub use connections::{Connections, Transport};
pub use error::{ManagerError, SessionError};
pub use idle::IdleStream;
pub use manager::{Manager, ManagerConfig, TransportCallback};
pub use session::{Session, SessionConfig};
