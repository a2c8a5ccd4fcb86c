//! Tessera Core - process-isolated invocation bridge and revalidating query cache.
//!
//! A privileged backend registers named channels; a sandboxed renderer invokes
//! them, listens for backend events and sends one-way signals, all over a
//! single framed connection. On the renderer side a stale-while-revalidate
//! cache deduplicates identical reads.
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use std::sync::Arc;
//! use tessera_core::{Backend, ChannelRegistry, IpcClient, IpcServer, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> tessera_core::Result<()> {
//!     let registry = Arc::new(ChannelRegistry::new());
//!     registry.register_fn("ping", |_| async { anyhow::Ok(json!("pong")) })?;
//!
//!     let server = IpcServer::start(Backend::new(registry)).await?;
//!     let client = IpcClient::connect(server.addr(), ProxyConfig::new()).await?;
//!
//!     assert_eq!(client.invoke("ping", json!(null)).await?, json!("pong"));
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod ipc;
pub mod renderer;
pub mod retry;

// Re-export commonly used types
pub use backend::{handler_fn, Backend, ChannelHandler, ChannelRegistry, ConnectionId, Dispatcher, EventBus, SignalHandler};
pub use cache::{CacheKey, CacheStats, CacheSubscription, Fetcher, QueryCache, Snapshot};
pub use channel::{Channel, EventChannel};
pub use config::{CacheConfig, EvictionPolicy, IpcConfig, KeyOptions, ProxyConfig};
pub use error::{BridgeError, ErrorDescriptor, ErrorKind, Result};
pub use ipc::{IpcClient, IpcServer, IpcServerHandle};
pub use renderer::{ListenerRegistry, RpcProxy, Subscription};
pub use retry::RetryConfig;
