//! End-to-end tests: a backend and a renderer joined by an in-memory stream.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::ipc::protocol::{decode, read_frame, write_frame};
use tessera_core::ipc::{serve_connection, Envelope, Outcome};
use tessera_core::{
    Backend, BridgeError, CacheConfig, ChannelRegistry, ErrorKind, Fetcher, IpcClient, KeyOptions,
    ProxyConfig, QueryCache,
};
use tokio::sync::mpsc;

/// Start serving `backend` on one end of a duplex pipe and return a client on
/// the other end.
fn connect(backend: Backend) -> Arc<IpcClient> {
    let (renderer_io, backend_io) = tokio::io::duplex(256 * 1024);
    tokio::spawn(serve_connection(
        backend_io,
        backend,
        std::future::pending::<()>(),
    ));
    Arc::new(IpcClient::from_stream(renderer_io, ProxyConfig::new()))
}

fn backend_with(setup: impl FnOnce(&ChannelRegistry)) -> Backend {
    let registry = Arc::new(ChannelRegistry::new());
    registry
        .register_fn("ping", |_| async { anyhow::Ok(json!("pong")) })
        .unwrap();
    setup(&registry);
    Backend::new(registry)
}

fn counting_handler(
    registry: &ChannelRegistry,
    channel: &str,
    delay: Duration,
    result: Value,
) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    registry
        .register_fn(channel, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let result = result.clone();
            async move {
                tokio::time::sleep(delay).await;
                anyhow::Ok(result)
            }
        })
        .unwrap();
    calls
}

#[tokio::test]
async fn test_ping_round_trip() {
    let client = connect(backend_with(|_| {}));
    assert_eq!(client.invoke("ping", json!([])).await.unwrap(), json!("pong"));
}

#[tokio::test]
async fn test_handler_error_reaches_caller_and_backend_keeps_serving() {
    let client = connect(backend_with(|registry| {
        registry
            .register_fn("loadProject", |_| async {
                Err::<Value, _>(anyhow::anyhow!("db down"))
            })
            .unwrap();
    }));

    let err = client.invoke("loadProject", json!([42])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handler);
    assert_eq!(err.to_string(), "db down");

    assert_eq!(client.invoke("ping", json!([])).await.unwrap(), json!("pong"));
}

#[tokio::test]
async fn test_unknown_channel_is_an_error_not_a_hang() {
    let client = connect(backend_with(|_| {}));
    let err = client.invoke("listProjects", json!([])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownChannel);
}

#[tokio::test]
async fn test_custom_error_code_survives_the_boundary() {
    let client = connect(backend_with(|registry| {
        registry
            .register_fn("quota", |_| async {
                Err::<Value, _>(anyhow::Error::new(BridgeError::handler("over quota", Some(429))))
            })
            .unwrap();
    }));

    let err = client.invoke("quota", Value::Null).await.unwrap_err();
    assert_eq!(err, BridgeError::handler("over quota", Some(429)));
}

#[tokio::test]
async fn test_file_changed_events_until_unsubscribed() {
    let backend = backend_with(|_| {});
    let client = connect(backend.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = client
        .on("fileChanged", move |payload| {
            let _ = tx.send(payload.clone());
        })
        .unwrap();
    client.invoke("ping", Value::Null).await.unwrap();

    assert_eq!(
        backend.events().publish("fileChanged", json!({"path": "/a.txt"})),
        1
    );
    let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload, json!({"path": "/a.txt"}));

    assert!(subscription.unsubscribe());
    client.invoke("ping", Value::Null).await.unwrap();
    assert_eq!(
        backend.events().publish("fileChanged", json!({"path": "/b.txt"})),
        0
    );

    client.invoke("ping", Value::Null).await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_responses_are_matched_by_id_not_arrival_order() {
    let client = connect(backend_with(|registry| {
        registry
            .register_fn("delayedEcho", |args| async move {
                let ms = args["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                anyhow::Ok(args["tag"].clone())
            })
            .unwrap();
    }));

    let slow = client.invoke("delayedEcho", json!({"ms": 100, "tag": "slow"}));
    let fast = client.invoke("delayedEcho", json!({"ms": 5, "tag": "fast"}));
    let (slow, fast) = tokio::join!(slow, fast);

    assert_eq!(slow.unwrap(), json!("slow"));
    assert_eq!(fast.unwrap(), json!("fast"));
}

#[tokio::test]
async fn test_concurrent_cache_reads_share_one_invocation() {
    let mut calls = None;
    let backend = backend_with(|registry| {
        calls = Some(counting_handler(
            registry,
            "listProjects",
            Duration::from_millis(50),
            json!([{"id": 1, "name": "alpha"}]),
        ));
    });
    let calls = calls.unwrap();
    let client = connect(backend);
    let cache = QueryCache::new(client.clone() as Arc<dyn Fetcher>, CacheConfig::new());

    let (a, b) = tokio::join!(
        cache.fetch("listProjects", json!([]), KeyOptions::new()),
        cache.fetch("listProjects", json!([]), KeyOptions::new()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(*a, json!([{"id": 1, "name": "alpha"}]));
}

#[tokio::test(start_paused = true)]
async fn test_deduping_interval_over_the_bridge() {
    let mut calls = None;
    let backend = backend_with(|registry| {
        calls = Some(counting_handler(
            registry,
            "listProjects",
            Duration::ZERO,
            json!(["alpha"]),
        ));
    });
    let calls = calls.unwrap();
    let client = connect(backend);
    let cache = QueryCache::new(
        client.clone() as Arc<dyn Fetcher>,
        CacheConfig::new().with_deduping_interval(Duration::from_millis(2000)),
    );

    cache
        .fetch("listProjects", json!([]), KeyOptions::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    cache
        .fetch("listProjects", json!([]), KeyOptions::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    cache
        .fetch("listProjects", json!([]), KeyOptions::new())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_malformed_request_is_answered_by_id() {
    let backend = backend_with(|_| {});
    let (mut renderer_io, backend_io) = tokio::io::duplex(64 * 1024);
    tokio::spawn(serve_connection(
        backend_io,
        backend,
        std::future::pending::<()>(),
    ));

    let bad = br#"{"type":"request","id":7,"channel":5}"#;
    write_frame(&mut renderer_io, bad).await.unwrap();

    let frame = read_frame(&mut renderer_io).await.unwrap().unwrap();
    match decode(&frame).unwrap() {
        Envelope::Response(response) => {
            assert_eq!(response.id, 7);
            match response.outcome {
                Outcome::Failure(error) => assert_eq!(error.kind, ErrorKind::Serialization),
                Outcome::Success(value) => panic!("unexpected success: {}", value),
            }
        }
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[tokio::test]
async fn test_backend_drop_rejects_pending_calls() {
    let (renderer_io, backend_io) = tokio::io::duplex(64 * 1024);
    let client = IpcClient::from_stream(renderer_io, ProxyConfig::new());

    let call = tokio::spawn(async move { client.invoke("ping", Value::Null).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(backend_io);

    let err = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}
