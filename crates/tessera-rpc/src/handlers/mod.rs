//! Built-in channels served by the host process, split by domain.

mod diagnostics;
mod status;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{ChannelRegistry, EventBus, EventChannel};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Periodic liveness event pushed to subscribed renderers.
pub struct BackendHeartbeat;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub sequence: u64,
    pub uptime_secs: u64,
}

impl EventChannel for BackendHeartbeat {
    const NAME: &'static str = "backend_heartbeat";
    type Payload = HeartbeatPayload;
}

/// Register every built-in channel and signal on `registry`.
///
/// `shutdown` is notified when a renderer invokes the `shutdown` channel.
pub fn register_builtin(
    registry: &Arc<ChannelRegistry>,
    shutdown: Arc<Notify>,
) -> tessera_core::Result<()> {
    status::register(registry, shutdown)?;
    diagnostics::register(registry)?;
    debug!("Registered {} built-in channels", registry.channels().len());
    Ok(())
}

/// Publish `backend_heartbeat` every `period` until the task is aborted.
pub async fn run_heartbeat(events: Arc<EventBus>, period: Duration) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sequence = 0u64;
    loop {
        ticker.tick().await;
        sequence += 1;
        let payload = HeartbeatPayload {
            sequence,
            uptime_secs: started.elapsed().as_secs(),
        };
        match events.emit::<BackendHeartbeat>(&payload) {
            Ok(0) => {}
            Ok(delivered) => debug!("Heartbeat {} sent to {} renderers", sequence, delivered),
            Err(e) => warn!("Failed to publish heartbeat: {}", e),
        }
    }
}
