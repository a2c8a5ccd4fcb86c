//! Status & lifecycle handlers.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tessera_core::{Channel, ChannelRegistry};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

/// Time given to the `shutdown` response to reach the renderer before the
/// host starts tearing connections down.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

pub struct ListChannels;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChannelFilter {
    #[serde(default)]
    pub prefix: Option<String>,
}

impl Channel for ListChannels {
    const NAME: &'static str = "list_channels";
    type Args = Option<ChannelFilter>;
    type Output = Vec<String>;
}

pub fn register(registry: &Arc<ChannelRegistry>, shutdown: Arc<Notify>) -> tessera_core::Result<()> {
    // Handlers live inside the registry; a strong reference would be a cycle.
    let weak: Weak<ChannelRegistry> = Arc::downgrade(registry);
    let started = Instant::now();

    registry.register_fn("health_check", {
        let weak = weak.clone();
        move |_| {
            let channels = weak.upgrade().map_or(0, |registry| registry.channels().len());
            async move {
                anyhow::Ok(json!({
                    "status": "ok",
                    "uptime_secs": started.elapsed().as_secs(),
                    "channels": channels,
                }))
            }
        }
    })?;

    registry.register_fn("ping", |_| async { anyhow::Ok(json!("pong")) })?;

    registry.register_channel::<ListChannels, _, _>(move |filter| {
        let names = list_channels(&weak, filter.unwrap_or_default());
        async move { anyhow::Ok(names) }
    })?;

    registry.register_fn("shutdown", move |_| {
        let shutdown = shutdown.clone();
        async move {
            info!("Shutdown requested over IPC");
            tokio::spawn(async move {
                tokio::time::sleep(SHUTDOWN_GRACE).await;
                shutdown.notify_one();
            });
            anyhow::Ok(json!({ "success": true }))
        }
    })?;

    Ok(())
}

fn list_channels(registry: &Weak<ChannelRegistry>, filter: ChannelFilter) -> Vec<String> {
    let Some(registry) = registry.upgrade() else {
        return Vec::new();
    };
    let mut names = registry.channels();
    if let Some(prefix) = filter.prefix {
        names.retain(|name| name.starts_with(&prefix));
    }
    names
}
