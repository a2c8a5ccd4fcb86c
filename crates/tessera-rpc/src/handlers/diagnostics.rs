//! Renderer-side diagnostics forwarded into the backend log.

use serde::Deserialize;
use std::sync::Arc;
use tessera_core::ChannelRegistry;
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct RendererLog {
    #[serde(default = "default_level")]
    level: String,
    message: String,
}

fn default_level() -> String {
    "info".to_string()
}

pub fn register(registry: &Arc<ChannelRegistry>) -> tessera_core::Result<()> {
    registry.register_signal_fn("renderer_log", |args| async move {
        let entry: RendererLog = serde_json::from_value(args)?;
        forward(&entry);
        anyhow::Ok(())
    })
}

fn forward(entry: &RendererLog) {
    match entry.level.as_str() {
        "error" => error!(source = "renderer", "{}", entry.message),
        "warn" | "warning" => warn!(source = "renderer", "{}", entry.message),
        "debug" | "trace" => debug!(source = "renderer", "{}", entry.message),
        _ => info!(source = "renderer", "{}", entry.message),
    }
}
