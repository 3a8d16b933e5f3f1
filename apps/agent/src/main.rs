//! Backhaul device agent entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting backhaul agent");

    let path = config::config_path(std::env::args_os().nth(1));
    let config = config::load(&path)?;
    tracing::info!(
        path = %path.display(),
        server = %config.server_url,
        tenant = %config.tenant_id,
        device = %config.device_id,
        version = %config.version,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("agent shut down cleanly");
    Ok(())
}
