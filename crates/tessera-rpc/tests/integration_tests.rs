//! Integration tests for the tessera-rpc host binary.
//!
//! Each test spawns the real binary, reads the announced port and drives it
//! through an `IpcClient` exactly as an embedding renderer would.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tessera_core::{ErrorKind, IpcClient, ProxyConfig};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

struct RpcServerHandle {
    child: tokio::process::Child,
    port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    fn addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    async fn client(&self) -> IpcClient {
        IpcClient::connect(
            self.addr(),
            ProxyConfig::new().with_call_timeout(Duration::from_secs(10)),
        )
        .await
        .expect("failed to connect to tessera-rpc")
    }

    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

fn binary_path() -> Result<PathBuf, String> {
    if let Some(path) = option_env!("CARGO_BIN_EXE_tessera-rpc") {
        return Ok(PathBuf::from(path));
    }

    let current_exe = std::env::current_exe()
        .map_err(|e| format!("failed to resolve current_exe for fallback: {e}"))?;
    let target_debug_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| "failed to resolve target/debug directory for fallback".to_string())?;

    let mut fallback = target_debug_dir.join("tessera-rpc");
    if cfg!(target_os = "windows") {
        fallback.set_extension("exe");
    }
    if !fallback.exists() {
        return Err(format!(
            "CARGO_BIN_EXE_tessera-rpc not set and fallback binary not found at {}",
            fallback.display()
        ));
    }
    Ok(fallback)
}

/// Start the host binary and wait until it announces its port.
async fn start_rpc_server(heartbeat_secs: u64) -> Result<RpcServerHandle, String> {
    let binary = binary_path()?;

    let mut child = tokio::process::Command::new(&binary)
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .arg("--heartbeat-secs")
        .arg(heartbeat_secs.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn tessera-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("RPC_PORT=") {
                    let parsed = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid RPC_PORT value '{value}': {e}"))?;
                    discovered_port = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read tessera-rpc stdout: {err}")),
            Err(_) => continue,
        }
    }

    let port =
        discovered_port.ok_or_else(|| "RPC_PORT line not emitted by tessera-rpc".to_string())?;

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(RpcServerHandle {
        child,
        port,
        stdout_drain: Some(stdout_drain),
    })
}

#[tokio::test]
async fn test_ping_and_health_check() {
    let server = start_rpc_server(0).await.unwrap();
    let client = server.client().await;

    let pong = client.invoke("ping", Value::Null).await.unwrap();
    assert_eq!(pong, json!("pong"));

    let health = client.invoke("health_check", json!({})).await.unwrap();
    assert_eq!(health["status"], "ok");
    assert!(health["uptime_secs"].is_u64());

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_list_channels() {
    let server = start_rpc_server(0).await.unwrap();
    let client = server.client().await;

    let channels = client.invoke("list_channels", Value::Null).await.unwrap();
    assert_eq!(
        channels,
        json!(["health_check", "list_channels", "ping", "shutdown"])
    );

    let filtered = client
        .invoke("list_channels", json!({"prefix": "sh"}))
        .await
        .unwrap();
    assert_eq!(filtered, json!(["shutdown"]));

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_channel_is_reported() {
    let server = start_rpc_server(0).await.unwrap();
    let client = server.client().await;

    let err = client.invoke("listProjects", json!([])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownChannel);

    // The host keeps serving after a failed call.
    assert_eq!(client.invoke("ping", Value::Null).await.unwrap(), json!("pong"));

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_calls_on_one_connection() {
    let server = start_rpc_server(0).await.unwrap();
    let client = server.client().await;

    let calls = (0..16).map(|_| client.invoke("ping", Value::Null));
    let results = futures::future::join_all(calls).await;
    assert!(results.iter().all(|r| r.as_ref().ok() == Some(&json!("pong"))));

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_heartbeat_events() {
    let server = start_rpc_server(1).await.unwrap();
    let client = server.client().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = client
        .on("backend_heartbeat", move |payload| {
            let _ = tx.send(payload.clone());
        })
        .unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no heartbeat within 5s")
        .unwrap();
    assert!(payload["sequence"].as_u64().unwrap() >= 1);

    subscription.unsubscribe();
    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_renderer_log_signal_is_accepted() {
    let server = start_rpc_server(0).await.unwrap();
    let client = server.client().await;

    client
        .send("renderer_log", json!({"level": "warn", "message": "hello"}))
        .unwrap();
    // Signals have no reply; the connection must still be usable.
    assert_eq!(client.invoke("ping", Value::Null).await.unwrap(), json!("pong"));

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_channel_stops_process() {
    let mut server = start_rpc_server(0).await.unwrap();
    let client = server.client().await;

    let response = client.invoke("shutdown", Value::Null).await.unwrap();
    assert_eq!(response, json!({"success": true}));

    let status = tokio::time::timeout(Duration::from_secs(10), server.child.wait())
        .await
        .expect("tessera-rpc did not exit after shutdown")
        .unwrap();
    assert!(status.success());

    // The connection is gone with the process.
    let err = client.invoke("ping", Value::Null).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}
