//! Backend end of the IPC connection.
//!
//! Listens on a local TCP port, accepts renderer connections, and serves each
//! one with [`serve_connection`]. Requests are dispatched on their own task,
//! so one slow handler never holds up other channels on the same connection.
//!
//! # Thread Safety
//!
//! Every connection owns a single writer task fed by a FIFO queue. Responses
//! and events for a connection are therefore written in the order they are
//! produced, and no lock is held while a handler runs.

use super::protocol::{decode, read_frame, recover_request_id, Envelope, InvocationResponse};
use super::transport::FrameSender;
use crate::backend::{Backend, ConnectionId};
use crate::config::IpcConfig;
use crate::error::Result;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle to a running IPC server. Dropping it shuts the server down.
pub struct IpcServerHandle {
    addr: SocketAddr,
    active: Arc<AtomicUsize>,
    stop: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl IpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Stop accepting connections and close the active ones.
    ///
    /// Handlers that are already running finish, but their responses have
    /// nowhere to go.
    pub fn shutdown(&mut self) {
        if self.stop.send_replace(true) {
            return;
        }
        info!("IPC server on {} shutting down", self.addr);
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Counts one live connection for as long as it is held.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < IpcConfig::MAX_CONNECTIONS).then_some(n + 1)
            })
            .ok()
            .map(|_| Self(active.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Resolves once `stop` flips to `true` or its sender is gone.
async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// IPC server that listens for renderer connections.
pub struct IpcServer;

impl IpcServer {
    /// Start the server on a random loopback port.
    pub async fn start(backend: Backend) -> Result<IpcServerHandle> {
        Self::bind(backend, "127.0.0.1", 0).await
    }

    /// Start the server on `host:port`. Port 0 lets the OS pick.
    pub async fn bind(backend: Backend, host: &str, port: u16) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        info!("IPC server listening on {}", addr);

        let (stop, stop_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));
        let accept_task = tokio::spawn(Self::accept_loop(listener, backend, stop_rx, active.clone()));

        Ok(IpcServerHandle {
            addr,
            active,
            stop,
            accept_task: Some(accept_task),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        backend: Backend,
        stop: watch::Receiver<bool>,
        active: Arc<AtomicUsize>,
    ) {
        let shutdown = stopped(stop.clone());
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("IPC accept error: {}", e);
                        continue;
                    }
                },
            };

            let Some(slot) = ConnectionSlot::acquire(&active) else {
                warn!(
                    "Rejecting IPC connection from {}: limit of {} reached",
                    peer,
                    IpcConfig::MAX_CONNECTIONS
                );
                continue;
            };
            tokio::spawn(Self::run_connection(stream, peer, backend.clone(), stop.clone(), slot));
        }
    }

    async fn run_connection(
        stream: TcpStream,
        peer: SocketAddr,
        backend: Backend,
        stop: watch::Receiver<bool>,
        _slot: ConnectionSlot,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", peer, e);
        }
        debug!("IPC connection from {}", peer);
        match serve_connection(stream, backend, stopped(stop)).await {
            Ok(()) => debug!("IPC connection {} closed", peer),
            Err(e) => debug!("IPC connection {} ended: {}", peer, e),
        }
    }
}

/// Serve one renderer connection until EOF, a read error, or `shutdown`.
///
/// Works over any byte stream, which is how tests drive the backend through
/// `tokio::io::duplex`.
pub async fn serve_connection<S, F>(stream: S, backend: Backend, shutdown: F) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: Future<Output = ()>,
{
    let connection = ConnectionId::new();
    let (mut reader, writer) = tokio::io::split(stream);
    let (outbound, _writer_task) = FrameSender::spawn(writer);
    tokio::pin!(shutdown);

    let result = loop {
        let frame = tokio::select! {
            read = read_frame(&mut reader) => match read {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
            _ = &mut shutdown => break Ok(()),
        };
        handle_frame(&backend, connection, &outbound, &frame);
    };

    let dropped = backend.events().remove_subscriber(connection);
    debug!(
        "Connection {} closed, dropped {} event subscription(s)",
        connection, dropped
    );
    result
}

fn handle_frame(backend: &Backend, connection: ConnectionId, outbound: &FrameSender, frame: &[u8]) {
    let envelope = match decode(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            match recover_request_id(frame) {
                Some(id) => {
                    warn!("Rejecting malformed request {} from {}: {}", id, connection, e);
                    let response = InvocationResponse::failure(id, e.to_descriptor());
                    let _ = outbound.post_now(Envelope::Response(response));
                }
                None => warn!("Dropping malformed frame from {}: {}", connection, e),
            }
            return;
        }
    };

    match envelope {
        Envelope::Request(request) => {
            let dispatcher = backend.dispatcher().clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let id = request.id;
                let response = dispatcher.dispatch(request).await;
                if outbound.post_now(Envelope::Response(response)).is_err() {
                    debug!("Connection closed before response {} was sent", id);
                }
            });
        }
        Envelope::Signal(signal) => {
            let dispatcher = backend.dispatcher().clone();
            tokio::spawn(async move { dispatcher.notify(signal).await });
        }
        Envelope::Subscribe { channel } => {
            backend.events().subscribe(&channel, connection, outbound.clone());
        }
        Envelope::Unsubscribe { channel } => {
            backend.events().unsubscribe(&channel, connection);
        }
        other @ (Envelope::Response(_) | Envelope::Event(_)) => {
            warn!("Ignoring unexpected {} from {}", other.kind_name(), connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChannelRegistry;
    use crate::error::ErrorKind;
    use crate::ipc::protocol::{encode, write_frame, EventMessage, InvocationRequest, Outcome};
    use serde_json::json;
    use std::time::Duration;

    fn echo_backend() -> Backend {
        let registry = Arc::new(ChannelRegistry::new());
        registry
            .register_fn("echo", |args| async move { anyhow::Ok(args) })
            .unwrap();
        registry
            .register_fn("fail", |_| async { Err::<serde_json::Value, _>(anyhow::anyhow!("test failure")) })
            .unwrap();
        Backend::new(registry)
    }

    async fn send(stream: &mut TcpStream, envelope: &Envelope) {
        write_frame(stream, &encode(envelope).unwrap()).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream) -> Envelope {
        let frame = read_frame(stream).await.unwrap().unwrap();
        decode(&frame).unwrap()
    }

    fn request(id: u64, channel: &str, args: serde_json::Value) -> Envelope {
        Envelope::Request(InvocationRequest {
            id,
            channel: channel.to_string(),
            args,
        })
    }

    async fn wait_for_subscribers(backend: &Backend, channel: &str, count: usize) {
        for _ in 0..100 {
            if backend.events().subscriber_count(channel) == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("'{}' never reached {} subscriber(s)", channel, count);
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let mut handle = IpcServer::start(echo_backend()).await.unwrap();

        assert!(handle.addr().port() > 0);
        assert_eq!(handle.addr().ip(), std::net::Ipv4Addr::LOCALHOST);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_echo_roundtrip() {
        let mut handle = IpcServer::start(echo_backend()).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        send(&mut stream, &request(1, "echo", json!({"hello": "world"}))).await;

        assert_eq!(
            recv(&mut stream).await,
            Envelope::Response(InvocationResponse::success(1, json!({"hello": "world"})))
        );

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_error_response() {
        let mut handle = IpcServer::start(echo_backend()).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        send(&mut stream, &request(2, "fail", json!({}))).await;

        match recv(&mut stream).await {
            Envelope::Response(InvocationResponse {
                id: 2,
                outcome: Outcome::Failure(descriptor),
            }) => {
                assert_eq!(descriptor.kind, ErrorKind::Handler);
                assert_eq!(descriptor.code, None);
                assert!(descriptor.message.contains("test failure"));
            }
            other => panic!("unexpected envelope: {:?}", other),
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_request_is_answered_by_id() {
        let mut handle = IpcServer::start(echo_backend()).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        write_frame(&mut stream, br#"{"type":"request","id":5,"args":[]}"#)
            .await
            .unwrap();
        write_frame(&mut stream, b"not valid json").await.unwrap();
        send(&mut stream, &request(6, "echo", json!(1))).await;

        match recv(&mut stream).await {
            Envelope::Response(response) => {
                assert_eq!(response.id, 5);
                match response.outcome {
                    Outcome::Failure(descriptor) => {
                        assert_eq!(descriptor.kind, ErrorKind::Serialization)
                    }
                    other => panic!("expected failure, got {:?}", other),
                }
            }
            other => panic!("unexpected envelope: {:?}", other),
        }
        // The unparseable frame is dropped; the connection keeps serving.
        assert_eq!(
            recv(&mut stream).await,
            Envelope::Response(InvocationResponse::success(6, json!(1)))
        );

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_subscribe_receives_published_events() {
        let backend = echo_backend();
        let mut handle = IpcServer::start(backend.clone()).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        send(
            &mut stream,
            &Envelope::Subscribe {
                channel: "fileChanged".into(),
            },
        )
        .await;
        wait_for_subscribers(&backend, "fileChanged", 1).await;

        assert_eq!(backend.events().publish("fileChanged", json!({"path": "/a"})), 1);
        assert_eq!(
            recv(&mut stream).await,
            Envelope::Event(EventMessage {
                channel: "fileChanged".into(),
                payload: json!({"path": "/a"}),
            })
        );

        drop(stream);
        wait_for_subscribers(&backend, "fileChanged", 0).await;
        assert_eq!(backend.events().publish("fileChanged", json!({})), 0);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_active_connections() {
        let mut handle = IpcServer::start(echo_backend()).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        send(&mut stream, &request(1, "echo", json!(null))).await;
        let _ = recv(&mut stream).await;

        handle.shutdown();

        let closed = tokio::time::timeout(Duration::from_secs(1), read_frame(&mut stream))
            .await
            .expect("connection should close after shutdown");
        assert!(matches!(closed, Ok(None) | Err(_)));
    }

    #[test]
    fn test_connection_slots_are_bounded() {
        let active = Arc::new(AtomicUsize::new(IpcConfig::MAX_CONNECTIONS - 1));

        let slot = ConnectionSlot::acquire(&active).unwrap();
        assert!(ConnectionSlot::acquire(&active).is_none());

        drop(slot);
        assert_eq!(active.load(Ordering::SeqCst), IpcConfig::MAX_CONNECTIONS - 1);
        assert!(ConnectionSlot::acquire(&active).is_some());
    }

    #[tokio::test]
    async fn test_serve_connection_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let backend = echo_backend();
        tokio::spawn(serve_connection(server, backend, std::future::pending()));

        let (mut reader, mut writer) = tokio::io::split(client);
        write_frame(&mut writer, &encode(&request(3, "echo", json!("hi"))).unwrap())
            .await
            .unwrap();
        let frame = read_frame(&mut reader).await.unwrap().unwrap();

        assert_eq!(
            decode(&frame).unwrap(),
            Envelope::Response(InvocationResponse::success(3, json!("hi")))
        );
    }
}
