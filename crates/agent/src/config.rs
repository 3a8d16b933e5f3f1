//! Agent runtime configuration.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use backhaul_protocol::ConnVersion;

/// Identity, server location and transport choice of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the tunnel server, e.g. `ws://tunnel.example.net:8080`.
    pub server_url: String,
    pub tenant_id: String,
    pub device_id: String,
    /// Transport to register with.
    #[serde(default = "default_version")]
    pub version: ConnVersion,
    /// Local SSH daemon that `ssh/open` requests are forwarded to.
    #[serde(default = "default_ssh_addr")]
    pub ssh_addr: String,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_version() -> ConnVersion {
    ConnVersion::V2
}

fn default_ssh_addr() -> String {
    "127.0.0.1:22".into()
}

impl AgentConfig {
    pub fn new(
        server_url: impl Into<String>,
        tenant_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            tenant_id: tenant_id.into(),
            device_id: device_id.into(),
            version: default_version(),
            ssh_addr: default_ssh_addr(),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Full URL of the registration upgrade for the configured version.
    pub fn connect_url(&self) -> String {
        self.url_for(self.version.connect_path())
    }

    /// Joins the server base URL with a path (query allowed).
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,
    /// Backoff cap.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay for a given attempt number (1-based), with ±25% jitter so a
    /// fleet of agents does not reconnect in lockstep after a server restart.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let offset: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        let with_jitter = (capped + capped * 0.25 * offset).max(0.05);
        Duration::from_secs_f64(with_jitter)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
