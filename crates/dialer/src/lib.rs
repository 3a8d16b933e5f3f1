//! Single entry point for reaching a device.
//!
//! [`Dialer::dial_to`] finds the device's transport, opens a logical
//! connection through it, runs the [`Target`] handshake for the requested
//! purpose and hands back a throttled, ready-to-use stream. Device
//! heartbeats and offline marks flow to a [`DeviceLifecycle`] collaborator.

mod error;
mod facade;
mod lifecycle;
mod target;

pub use error::DialError;
pub use facade::{Dialer, DialedConn, ThrottleConfig};
pub use lifecycle::{DeviceLifecycle, LifecycleFuture, LifecycleResult, TracingLifecycle};
pub use target::{HttpProxyTarget, PrepareFuture, SshCloseTarget, SshOpenTarget, Target};
