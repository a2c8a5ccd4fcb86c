//! Renderer end of the IPC connection.
//!
//! [`IpcClient`] owns one framed stream to the backend and exposes the three
//! bridge primitives on top of it: `invoke`, `on` and `send`. A reader task
//! routes responses to the RPC proxy and events to the listener registry.
//!
//! # Thread Safety
//!
//! The client is `Send + Sync` and meant to be shared behind an `Arc`. Any
//! number of calls may be in flight at once; they share one connection and are
//! told apart by correlation id.

use super::protocol::{decode, read_frame, recover_response_id, Envelope, InvocationResponse, SignalMessage};
use super::transport::FrameSender;
use crate::cache::Fetcher;
use crate::channel::{validate_channel_name, Channel, EventChannel};
use crate::config::{IpcConfig, ProxyConfig};
use crate::error::{BridgeError, ErrorKind, Result};
use crate::renderer::{ListenerRegistry, RpcProxy, Subscription};
use crate::retry::{retry_async, RetryConfig};
use async_trait::async_trait;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct IpcClient {
    proxy: Arc<RpcProxy>,
    listeners: Arc<ListenerRegistry>,
    outbound: FrameSender,
    connected: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IpcClient {
    /// Connect to a backend's IPC server.
    ///
    /// Gives up after `IpcConfig::CONNECT_TIMEOUT`.
    pub async fn connect(addr: SocketAddr, config: ProxyConfig) -> Result<Self> {
        let stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| BridgeError::transport(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| BridgeError::transport(format!("Failed to connect to {}: {}", addr, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", addr, e);
        }

        debug!("IPC client connected to {}", addr);
        Ok(Self::from_stream(stream, config))
    }

    /// Connect, retrying transport failures with backoff while the backend
    /// is still coming up.
    pub async fn connect_with_retry(addr: SocketAddr, config: ProxyConfig, retry: &RetryConfig) -> Result<Self> {
        let (result, stats) = retry_async(
            retry,
            || Self::connect(addr, config.clone()),
            |e: &BridgeError| e.kind() == ErrorKind::Transport,
        )
        .await;
        if result.is_ok() && stats.attempts > 1 {
            info!("Connected to {} after {} attempts", addr, stats.attempts);
        }
        result
    }

    /// Run the bridge over an already established stream.
    pub fn from_stream<S>(stream: S, config: ProxyConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, writer_task) = FrameSender::spawn(writer);
        let proxy = Arc::new(RpcProxy::new(Arc::new(outbound.clone()), config));
        let listeners = Arc::new(ListenerRegistry::with_control(outbound.clone()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(Self::read_loop(
            reader,
            proxy.clone(),
            listeners.clone(),
            connected.clone(),
        ));

        Self {
            proxy,
            listeners,
            outbound,
            connected,
            tasks: Mutex::new(vec![reader_task, writer_task]),
        }
    }

    async fn read_loop<R>(
        mut reader: R,
        proxy: Arc<RpcProxy>,
        listeners: Arc<ListenerRegistry>,
        connected: Arc<AtomicBool>,
    ) where
        R: AsyncRead + Unpin,
    {
        let reason = loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break "Backend connection closed".to_string(),
                Err(e) => break format!("Backend connection failed: {}", e),
            };

            match decode(&frame) {
                Ok(Envelope::Response(response)) => {
                    proxy.settle(response);
                }
                Ok(Envelope::Event(event)) => {
                    listeners.emit(&event.channel, &event.payload);
                }
                Ok(other) => warn!("Ignoring unexpected {} from backend", other.kind_name()),
                Err(e) => match recover_response_id(&frame) {
                    Some(id) => {
                        warn!("Malformed response {}: {}", id, e);
                        proxy.settle(InvocationResponse::failure(id, e.to_descriptor()));
                    }
                    None => warn!("Dropping malformed frame from backend: {}", e),
                },
            }
        };

        connected.store(false, Ordering::SeqCst);
        info!("{}", reason);
        proxy.fail_all(BridgeError::transport(reason));
    }

    /// Invoke `channel` and wait for its result.
    pub async fn invoke(&self, channel: &str, args: Value) -> Result<Value> {
        self.proxy.call(channel, args).await
    }

    pub async fn invoke_typed<C: Channel>(&self, args: C::Args) -> Result<C::Output> {
        self.proxy.call_typed::<C>(args).await
    }

    /// Listen for backend events on `channel`.
    pub fn on<F>(&self, channel: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listeners.subscribe(channel, callback)
    }

    /// Listen for a typed event. Payloads that do not decode are logged and
    /// skipped.
    pub fn on_event<E, F>(&self, callback: F) -> Result<Subscription>
    where
        E: EventChannel,
        F: Fn(E::Payload) + Send + Sync + 'static,
    {
        self.listeners.subscribe(E::NAME, move |payload| {
            match serde_json::from_value::<E::Payload>(payload.clone()) {
                Ok(payload) => callback(payload),
                Err(e) => warn!("Undecodable '{}' payload: {}", E::NAME, e),
            }
        })
    }

    /// Fire-and-forget signal to the backend.
    pub fn send(&self, channel: &str, args: Value) -> Result<()> {
        validate_channel_name(channel)?;
        self.outbound.post_now(Envelope::Signal(SignalMessage {
            channel: channel.to_string(),
            args,
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn proxy(&self) -> &Arc<RpcProxy> {
        &self.proxy
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    /// Tear down the connection. Pending calls reject with `Transport`, all
    /// listeners are dropped. Backend handlers already running are not
    /// affected.
    pub fn close(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if tasks.is_empty() {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        for task in tasks {
            task.abort();
        }
        self.listeners.clear();
        self.proxy.fail_all(BridgeError::transport("IPC client closed"));
        debug!("IPC client closed");
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Fetcher for IpcClient {
    async fn fetch(&self, channel: &str, args: Value) -> Result<Value> {
        self.invoke(channel, args).await
    }
}
