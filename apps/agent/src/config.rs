//! Agent configuration file.
//!
//! TOML, path given as the first argument, else `BACKHAUL_AGENT_CONFIG`,
//! else `/etc/backhaul/agent.toml`:
//!
//! ```toml
//! server_url = "ws://tunnel.example.net:8080"
//! tenant_id = "acme"
//! device_id = "gw-0042"
//! version = "v2"
//! ssh_addr = "127.0.0.1:22"
//!
//! [reconnect]
//! initial_delay_ms = 250
//! max_delay_ms = 15000
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Context;

use backhaul_agent::AgentConfig;

const DEFAULT_PATH: &str = "/etc/backhaul/agent.toml";

/// Resolves the configuration path from the command line or environment.
pub fn config_path(arg: Option<OsString>) -> PathBuf {
    arg.or_else(|| std::env::var_os("BACKHAUL_AGENT_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PATH))
}

/// Loads the agent configuration. The identity has no sensible default,
/// so a missing file is an error.
pub fn load(path: &Path) -> anyhow::Result<AgentConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: AgentConfig =
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    if config.tenant_id.is_empty() || config.device_id.is_empty() {
        anyhow::bail!("tenant_id and device_id must be set in {}", path.display());
    }
    Ok(config)
}
