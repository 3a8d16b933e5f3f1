//! Tunnel server configuration.
//!
//! TOML, path given as the first argument, else `BACKHAUL_SERVER_CONFIG`,
//! else `/etc/backhaul/server.toml`. A missing file means all defaults.

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use backhaul_connman::ManagerConfig;
use backhaul_dialer::ThrottleConfig;
use backhaul_protocol::constants::{PICKUP_PATH, PING_TIMEOUT, SESSION_PING_INTERVAL, V1_PROBE_INTERVAL};
use backhaul_server::ServerConfig;

const DEFAULT_PATH: &str = "/etc/backhaul/server.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the tunnel listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Base path advertised for v1 pick-up upgrades.
    #[serde(default = "default_pickup_path")]
    pub pickup_path: String,

    #[serde(default)]
    pub liveness: LivenessConfig,

    /// Byte-rate limits applied to every dialed connection.
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

/// Probe timing, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub v1_probe_interval_secs: u64,
    pub v2_ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            v1_probe_interval_secs: V1_PROBE_INTERVAL.as_secs(),
            v2_ping_interval_secs: SESSION_PING_INTERVAL.as_secs(),
            ping_timeout_secs: PING_TIMEOUT.as_secs(),
        }
    }
}

fn default_listen() -> SocketAddr {
    ServerConfig::default().bind
}

fn default_pickup_path() -> String {
    PICKUP_PATH.into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            pickup_path: default_pickup_path(),
            liveness: LivenessConfig::default(),
            throttle: ThrottleConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        config
            .throttle
            .validate()
            .with_context(|| format!("invalid [throttle] in {}", path.display()))?;
        Ok(config)
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            bind: self.listen,
            pickup_path: self.pickup_path.clone(),
        }
    }

    pub fn manager(&self) -> ManagerConfig {
        ManagerConfig {
            v1_probe_interval: Duration::from_secs(self.liveness.v1_probe_interval_secs.max(1)),
            v2_ping_interval: Duration::from_secs(self.liveness.v2_ping_interval_secs.max(1)),
            ping_timeout: Duration::from_secs(self.liveness.ping_timeout_secs.max(1)),
            ..ManagerConfig::default()
        }
    }
}

/// Resolves the configuration path from the command line or environment.
pub fn config_path(arg: Option<OsString>) -> PathBuf {
    arg.or_else(|| std::env::var_os("BACKHAUL_SERVER_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PATH))
}
