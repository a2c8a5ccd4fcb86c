//! Tessera RPC - backend host process for the IPC bridge.
//!
//! Binds a local TCP listener, registers the built-in channels and serves
//! renderer connections until ctrl-c or a `shutdown` invocation.

mod handlers;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{Backend, ChannelRegistry, IpcServer};
use tokio::sync::Notify;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tessera-rpc")]
#[command(about = "IPC backend host for Tessera")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Seconds between `backend_heartbeat` events (0 = disabled)
    #[arg(long, default_value = "5")]
    heartbeat_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout is reserved for the port announcement
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("Starting Tessera RPC host");

    let shutdown = Arc::new(Notify::new());
    let registry = Arc::new(ChannelRegistry::new());
    handlers::register_builtin(&registry, shutdown.clone())?;

    let backend = Backend::new(registry);
    let mut server = IpcServer::bind(backend.clone(), &args.host, args.port).await?;

    // Print port for the embedding process to read (intentional stdout for IPC)
    println!("RPC_PORT={}", server.addr().port());

    info!("IPC server running on {}", server.addr());

    let heartbeat = (args.heartbeat_secs > 0).then(|| {
        tokio::spawn(handlers::run_heartbeat(
            backend.events().clone(),
            Duration::from_secs(args.heartbeat_secs),
        ))
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received, exiting");
        }
        _ = shutdown.notified() => {
            info!("Shutdown requested by renderer, exiting");
        }
    }

    if let Some(task) = heartbeat {
        task.abort();
    }
    server.shutdown();

    Ok(())
}
