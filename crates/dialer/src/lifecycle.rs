use std::pin::Pin;

use tracing::{debug, info};

use backhaul_protocol::DeviceKey;

pub type LifecycleResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub type LifecycleFuture<'a> = Pin<Box<dyn Future<Output = LifecycleResult> + Send + 'a>>;

/// Device status store updated from transport liveness.
pub trait DeviceLifecycle: Send + Sync + 'static {
    /// The device's transport answered a liveness probe.
    fn heartbeat<'a>(&'a self, device: &'a DeviceKey) -> LifecycleFuture<'a>;

    /// The device's transport is gone.
    fn mark_offline<'a>(&'a self, device: &'a DeviceKey) -> LifecycleFuture<'a>;
}

/// Lifecycle sink that only logs. Used when no status store is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLifecycle;

impl DeviceLifecycle for TracingLifecycle {
    fn heartbeat<'a>(&'a self, device: &'a DeviceKey) -> LifecycleFuture<'a> {
        Box::pin(async move {
            debug!(key = %device, "device heartbeat");
            Ok(())
        })
    }

    fn mark_offline<'a>(&'a self, device: &'a DeviceKey) -> LifecycleFuture<'a> {
        Box::pin(async move {
            info!(key = %device, "device offline");
            Ok(())
        })
    }
}
