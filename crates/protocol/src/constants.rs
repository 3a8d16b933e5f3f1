use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Interval between `keep-alive` control messages on a v1 control socket.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Idle window after which a v1 listener gives up on its control socket.
///
/// Slightly above [`KEEP_ALIVE_INTERVAL`] so a single delayed keep-alive
/// does not tear the tunnel down. NAT mappings expire silently, so missing
/// keep-alives are the only signal available.
pub const LISTENER_IDLE_TIMEOUT: Duration = Duration::from_secs(35);

/// Interval between liveness pings on a registered v2 session.
pub const SESSION_PING_INTERVAL: Duration = Duration::from_secs(35);

/// Interval between liveness probes on a registered v1 transport.
pub const V1_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// How long a liveness ping may stay unanswered.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed to write a single WebSocket frame.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(30);

/// Maximum WebSocket message size accepted on tunnel sockets (16 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Timeout for opening a new v2 stream.
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// A v2 stream with no traffic in either direction for this long is reset.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Maximum number of concurrently open streams on one v2 session.
pub const SESSION_MAX_STREAMS: usize = 256;

/// Inbound streams queued on the agent before new ones are refused.
pub const SESSION_ACCEPT_BACKLOG: usize = 256;

/// How long a pick-up connection waits for a dialer to claim it.
pub const PICKUP_DELIVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum length of a single v1 control line.
pub const MAX_CONTROL_LINE: usize = 4096;

/// Maximum size of an HTTP/1.1 head or JSON header line on a logical connection.
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Upgrade path for v1 agent control sockets.
pub const V1_CONNECT_PATH: &str = "/ssh/connection";

/// Upgrade path for v2 agent sessions.
pub const V2_CONNECT_PATH: &str = "/agent/connection";

/// Base path advertised in `conn-ready` messages for pick-up upgrades.
pub const PICKUP_PATH: &str = "/ssh/revdial";

/// Header carrying the tenant of a connecting agent.
pub const HEADER_TENANT_ID: &str = "X-Tenant-ID";

/// Header carrying the device UID of a connecting agent.
pub const HEADER_DEVICE_UID: &str = "X-Device-UID";

/// v2 protocol id: open an SSH session.
pub const PROTO_SSH_OPEN: &str = "/ssh/open/1.0.0";

/// v2 protocol id: close an SSH session.
pub const PROTO_SSH_CLOSE: &str = "/ssh/close/1.0.0";

/// v2 protocol id: HTTP proxy through the device.
pub const PROTO_HTTP_PROXY: &str = "/http/proxy/1.0.0";

/// Transport version a logical connection was obtained through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnVersion {
    /// One pick-up handshake per logical connection.
    V1,
    /// One multiplexed stream per logical connection.
    V2,
}

impl ConnVersion {
    /// Numeric form used in logs and query strings.
    pub fn as_u8(self) -> u8 {
        match self {
            ConnVersion::V1 => 1,
            ConnVersion::V2 => 2,
        }
    }

    /// Upgrade path an agent uses to register a transport of this version.
    pub fn connect_path(self) -> &'static str {
        match self {
            ConnVersion::V1 => V1_CONNECT_PATH,
            ConnVersion::V2 => V2_CONNECT_PATH,
        }
    }
}

impl fmt::Display for ConnVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}
