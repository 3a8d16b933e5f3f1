//! Wires the tunnel server, connection manager and dialer together.

use std::sync::Arc;

use backhaul_dialer::{Dialer, TracingLifecycle};
use backhaul_revdial::DialerRegistry;
use backhaul_server::TunnelServer;

use crate::config::Config;

/// Runs the tunnel server until SIGINT.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let dialer = Arc::new(Dialer::new(
        DialerRegistry::new(),
        config.manager(),
        Arc::new(TracingLifecycle),
        config.throttle,
    )?);
    let server = TunnelServer::new(config.server(), dialer);

    let mut serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        result = &mut serving => {
            result??;
            return Ok(());
        }
    }

    server.shutdown();
    serving.await??;
    Ok(())
}
