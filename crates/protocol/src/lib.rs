//! Wire protocol types shared by the server and the agent.
//!
//! Covers the v1 line-delimited control protocol, the v2 per-stream
//! headers and multistream-select negotiation, and the small HTTP/1.1
//! head codec used on v1 logical connections.

pub mod constants;
pub mod control;
pub mod error;
pub mod headers;
pub mod http1;
pub mod key;
pub mod multistream;

pub use constants::ConnVersion;
pub use control::{Command, ControlMessage};
pub use error::ProtocolError;
pub use headers::{ProxyReply, ProxyRequest, SessionHeader};
pub use key::DeviceKey;
