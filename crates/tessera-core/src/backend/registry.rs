//! Channel registry: maps channel names to the handlers that serve them.
//!
//! The registry is a plain value owned by a [`Backend`](super::Backend), so any
//! number of independent backends can live in one process. Invocation
//! handlers and one-way signal handlers have separate namespaces; both reject
//! a second registration for the same name unless `replace` is used.

use crate::channel::{validate_channel_name, Channel};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Serves one request/response channel.
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    async fn handle(&self, args: Value) -> anyhow::Result<Value>;
}

/// Receives one-way signals sent by the renderer.
#[async_trait]
pub trait SignalHandler: Send + Sync + 'static {
    async fn notify(&self, args: Value) -> anyhow::Result<()>;
}

/// Adapts an async closure over raw JSON into a [`ChannelHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ChannelHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, args: Value) -> anyhow::Result<Value> {
        (self.f)(args).await
    }
}

/// Decodes `C::Args` and encodes `C::Output` around a typed closure.
struct TypedHandler<C, F> {
    f: F,
    _channel: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C, F, Fut> ChannelHandler for TypedHandler<C, F>
where
    C: Channel,
    F: Fn(C::Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<C::Output>> + Send + 'static,
{
    async fn handle(&self, args: Value) -> anyhow::Result<Value> {
        let args: C::Args = serde_json::from_value(args).map_err(|e| {
            BridgeError::serialization(format!("Invalid arguments for '{}': {}", C::NAME, e))
        })?;
        let output = (self.f)(args).await?;
        let value = serde_json::to_value(output).map_err(|e| {
            BridgeError::serialization(format!("Unserializable result from '{}': {}", C::NAME, e))
        })?;
        Ok(value)
    }
}

struct FnSignal<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> SignalHandler for FnSignal<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn notify(&self, args: Value) -> anyhow::Result<()> {
        (self.f)(args).await
    }
}

/// Backend-side table of channel handlers.
#[derive(Default)]
pub struct ChannelRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ChannelHandler>>>,
    signals: RwLock<HashMap<String, Arc<dyn SignalHandler>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `channel`.
    ///
    /// Fails with `DuplicateChannel` if the channel is already bound; the
    /// existing handler stays active.
    pub fn register<H: ChannelHandler>(&self, channel: &str, handler: H) -> Result<()> {
        validate_channel_name(channel)?;
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(channel) {
            return Err(BridgeError::duplicate_channel(channel));
        }
        handlers.insert(channel.to_string(), Arc::new(handler));
        debug!("Registered channel '{}'", channel);
        Ok(())
    }

    pub fn register_fn<F, Fut>(&self, channel: &str, f: F) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(channel, handler_fn(f))
    }

    /// Register a handler for a typed channel contract.
    pub fn register_channel<C, F, Fut>(&self, f: F) -> Result<()>
    where
        C: Channel,
        F: Fn(C::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<C::Output>> + Send + 'static,
    {
        self.register(
            C::NAME,
            TypedHandler::<C, F> {
                f,
                _channel: PhantomData,
            },
        )
    }

    /// Bind `handler` to `channel`, displacing any existing handler.
    ///
    /// Returns `true` if a previous handler was replaced.
    pub fn replace<H: ChannelHandler>(&self, channel: &str, handler: H) -> Result<bool> {
        validate_channel_name(channel)?;
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = handlers
            .insert(channel.to_string(), Arc::new(handler))
            .is_some();
        if replaced {
            info!("Replaced handler for channel '{}'", channel);
        }
        Ok(replaced)
    }

    pub fn unregister(&self, channel: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel)
            .is_some()
    }

    /// Look up the handler for `channel` at call time.
    pub fn resolve(&self, channel: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(channel)
    }

    /// Registered invocation channels, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn register_signal<H: SignalHandler>(&self, channel: &str, handler: H) -> Result<()> {
        validate_channel_name(channel)?;
        let mut signals = self.signals.write().unwrap_or_else(PoisonError::into_inner);
        if signals.contains_key(channel) {
            return Err(BridgeError::duplicate_channel(channel));
        }
        signals.insert(channel.to_string(), Arc::new(handler));
        debug!("Registered signal '{}'", channel);
        Ok(())
    }

    pub fn register_signal_fn<F, Fut>(&self, channel: &str, f: F) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_signal(channel, FnSignal { f })
    }

    pub fn resolve_signal(&self, channel: &str) -> Option<Arc<dyn SignalHandler>> {
        self.signals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
    }
}
