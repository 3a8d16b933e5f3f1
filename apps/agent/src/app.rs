//! Wires the forwarding handler into the agent runtime.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use backhaul_agent::{Agent, AgentConfig, ForwardHandler};

/// Runs the agent until SIGINT.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let handler = Arc::new(ForwardHandler::new(config.ssh_addr.clone()));
    let agent = Agent::new(config, handler);

    let mut runner = {
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(&cancel).await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        // Only returns early on a fatal configuration error.
        result = &mut runner => {
            result??;
            return Ok(());
        }
    }

    cancel.cancel();
    runner.await??;
    Ok(())
}
