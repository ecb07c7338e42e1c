//! Integration tests for the connection actor and pub/sub routing.
//!
//! Peers are attached through the in-memory transport so each test drives
//! the full read loop, dispatch, fan-out and drain without sockets.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use chanmux_core::{ConnectionState, PeerId};
use chanmuxd::transport::{self, MemoryPeer};
use chanmuxd::{HandlerError, Server, ServerConfig};

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for an expected frame
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait before concluding no frame is coming
const SILENCE: Duration = Duration::from_millis(100);

/// Maximum time to wait for a state change
const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between state checks
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Test Helpers
// ============================================================================

/// Server with a `ping` handler that answers `pong` on the same channel.
async fn test_server() -> Server {
    let server = Server::new(ServerConfig::default(), CancellationToken::new());
    server
        .handle_fn("ping", |_req, rw| async move {
            rw.write("pong", &Value::Null).await;
            Ok(())
        })
        .await
        .unwrap();
    server
}

/// Attaches a peer identified as `id`.
async fn connect(server: &Server, id: &str) -> MemoryPeer {
    let (sink, frames, mut peer) = transport::memory(64);
    server.spawn_connection(sink, frames);
    assert!(peer.send(id).await);
    peer
}

async fn send(peer: &mut MemoryPeer, channel: &str, kind: &str, body: Value) {
    let frame = json!({"channel": channel, "type": kind, "body": body});
    assert!(peer.send(frame.to_string()).await);
}

async fn recv(peer: &mut MemoryPeer) -> Value {
    let frame = timeout(RECV_TIMEOUT, peer.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("connection closed");
    serde_json::from_str(&frame).unwrap()
}

async fn assert_silent(peer: &mut MemoryPeer) {
    if let Ok(Some(frame)) = timeout(SILENCE, peer.recv()).await {
        panic!("unexpected frame: {frame}");
    }
}

/// Round-trips a `ping` on `probe`. Every frame sent before it has been
/// applied once the `pong` arrives.
async fn sync(peer: &mut MemoryPeer) {
    send(peer, "probe", "ping", Value::Null).await;
    let frame = recv(peer).await;
    assert_eq!(frame["type"], "pong", "expected pong, got {frame}");
}

async fn wait_for_connections(server: &Server, expected: usize) {
    let start = Instant::now();
    while start.elapsed() < WAIT_TIMEOUT {
        if server.connection_count().await == expected {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!(
        "expected {expected} connections, found {}",
        server.connection_count().await
    );
}

async fn wait_for_lock_count(server: &Server, expected: usize) {
    let start = Instant::now();
    while start.elapsed() < WAIT_TIMEOUT {
        if server.locks().len() == expected {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!(
        "expected {expected} lock entries, found {}",
        server.locks().len()
    );
}

// ============================================================================
// Channels
// ============================================================================

#[tokio::test]
async fn test_channel_created_once_per_name() {
    let server = test_server().await;
    let mut peer = connect(&server, "peer-A").await;

    send(&mut peer, "c1", "open", Value::Null).await;
    send(&mut peer, "c1", "open", Value::Null).await;
    send(&mut peer, "c1", "subscribe", json!("temps")).await;
    sync(&mut peer).await;

    let snapshot = server.snapshot().await;
    let conn = snapshot.connection("peer-A").unwrap();
    let names: Vec<&str> = conn.channels.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["c1", "probe"]);

    let c1 = conn.channel("c1").unwrap();
    assert_eq!(c1.stats.received, 3);
    assert_eq!(c1.subscriptions, vec!["temps"]);
}

#[tokio::test]
async fn test_subscribe_is_case_insensitive() {
    let server = test_server().await;
    let mut peer = connect(&server, "peer-A").await;

    send(&mut peer, "c1", "subscribe", json!("Foo")).await;
    send(&mut peer, "c1", "subscribe", json!("foo")).await;
    sync(&mut peer).await;

    let snapshot = server.snapshot().await;
    let c1 = snapshot.connection("peer-A").unwrap().channel("c1").unwrap();
    assert_eq!(c1.subscriptions, vec!["foo"]);

    assert_eq!(server.publish("FOO", "update", &1).await, 1);
    let frame = recv(&mut peer).await;
    assert_eq!(frame, json!({"channel": "c1", "type": "update", "body": 1}));
    assert_silent(&mut peer).await;
}

#[tokio::test]
async fn test_close_removes_channel_from_fanout() {
    let server = test_server().await;
    let mut peer = connect(&server, "peer-A").await;

    send(&mut peer, "c1", "subscribe", json!("temps")).await;
    sync(&mut peer).await;
    send(&mut peer, "c1", "close", Value::Null).await;
    sync(&mut peer).await;

    assert_eq!(server.publish("temps", "update", &json!({"v": 1})).await, 0);
    assert_silent(&mut peer).await;

    let snapshot = server.snapshot().await;
    assert!(snapshot.connection("peer-A").unwrap().channel("c1").is_none());
}

#[tokio::test]
async fn test_invalid_subscribe_body_reports_error() {
    let server = test_server().await;
    let mut peer = connect(&server, "peer-A").await;

    send(&mut peer, "c1", "subscribe", json!(5)).await;
    let frame = recv(&mut peer).await;
    assert_eq!(frame["channel"], "c1");
    assert_eq!(frame["type"], "error");
    assert!(frame["body"].as_str().unwrap().contains("expected a string"));

    send(&mut peer, "c1", "subscribe", json!("  ")).await;
    let frame = recv(&mut peer).await;
    assert_eq!(frame["type"], "error");

    sync(&mut peer).await;
}

// ============================================================================
// Publish
// ============================================================================

/// Drains `count` frames and returns their channel names.
async fn channels_of(peer: &mut MemoryPeer, count: usize) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for _ in 0..count {
        let frame = recv(peer).await;
        names.insert(frame["channel"].as_str().unwrap().to_string());
    }
    names
}

#[tokio::test]
async fn test_publish_reaches_exactly_subscribed_channels() {
    let server = test_server().await;
    let mut a = connect(&server, "peer-A").await;
    let mut b = connect(&server, "peer-B").await;

    send(&mut a, "a1", "subscribe", json!("temps")).await;
    send(&mut a, "a2", "subscribe", json!("load")).await;
    send(&mut b, "b1", "subscribe", json!("temps")).await;
    send(&mut b, "b2", "subscribe", json!("temps")).await;
    send(&mut b, "b2", "subscribe", json!("load")).await;
    sync(&mut a).await;
    sync(&mut b).await;

    assert_eq!(server.publish("temps", "update", &json!({"v": 42})).await, 3);
    assert_eq!(channels_of(&mut a, 1).await, BTreeSet::from(["a1".to_string()]));
    assert_eq!(
        channels_of(&mut b, 2).await,
        BTreeSet::from(["b1".to_string(), "b2".to_string()])
    );

    assert_eq!(server.publish("load", "update", &json!({"v": 7})).await, 2);
    assert_eq!(channels_of(&mut a, 1).await, BTreeSet::from(["a2".to_string()]));
    assert_eq!(channels_of(&mut b, 1).await, BTreeSet::from(["b2".to_string()]));

    assert_eq!(server.publish("nobody", "update", &0).await, 0);
    assert_silent(&mut a).await;
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn test_handler_publish_fans_out() {
    let server = test_server().await;
    server
        .handle_fn("announce", |req, rw| async move {
            let text: String = req.unpack().await?;
            rw.publish("news", "headline", &text).await;
            Ok(())
        })
        .await
        .unwrap();

    let mut a = connect(&server, "peer-A").await;
    let mut b = connect(&server, "peer-B").await;
    send(&mut b, "feed", "subscribe", json!("news")).await;
    sync(&mut b).await;

    send(&mut a, "cmd", "announce", json!("hello")).await;
    let frame = recv(&mut b).await;
    assert_eq!(
        frame,
        json!({"channel": "feed", "type": "headline", "body": "hello"})
    );
    assert_silent(&mut a).await;
}

// ============================================================================
// Write
// ============================================================================

#[tokio::test]
async fn test_server_write_targets_peer_channel() {
    let server = test_server().await;
    let mut peer = connect(&server, "peer-A").await;
    sync(&mut peer).await;

    let id = PeerId::new("peer-A");
    assert!(server.write(&id, "probe", "note", &json!({"n": 1})).await);
    let frame = recv(&mut peer).await;
    assert_eq!(
        frame,
        json!({"client": "peer-A", "channel": "probe", "type": "note", "body": {"n": 1}})
    );

    assert!(!server.write(&id, "missing", "note", &1).await);
    assert!(!server.write(&PeerId::new("peer-Z"), "probe", "note", &1).await);
    assert_silent(&mut peer).await;
}

// ============================================================================
// Dispatch errors
// ============================================================================

#[derive(Debug, Deserialize)]
struct IssueQuery {
    #[allow(dead_code)]
    issue: String,
}

#[tokio::test]
async fn test_unpack_failure_writes_exactly_one_error() {
    let server = test_server().await;
    let proceeded = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&proceeded);
    server
        .handle_fn("jira.get", move |req, _rw| {
            let flag = Arc::clone(&flag);
            async move {
                let _query: IssueQuery = req.unpack().await?;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

    let mut peer = connect(&server, "peer-A").await;
    send(&mut peer, "c1", "jira.get", json!(42)).await;

    let frame = recv(&mut peer).await;
    assert_eq!(frame["channel"], "c1");
    assert_eq!(frame["type"], "error");
    assert!(frame["body"].is_string());

    sync(&mut peer).await;
    assert!(!proceeded.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_unknown_type_writes_error() {
    let server = test_server().await;
    let mut peer = connect(&server, "peer-A").await;

    send(&mut peer, "c1", "nope", Value::Null).await;
    let frame = recv(&mut peer).await;
    assert_eq!(
        frame,
        json!({"channel": "c1", "type": "error", "body": "unknown type: nope"})
    );
}

#[tokio::test]
async fn test_handler_failure_writes_error() {
    let server = test_server().await;
    server
        .handle_fn("fail", |_req, _rw| async {
            Err(HandlerError::failed("backend unavailable"))
        })
        .await
        .unwrap();

    let mut peer = connect(&server, "peer-A").await;
    send(&mut peer, "c1", "fail", Value::Null).await;

    let frame = recv(&mut peer).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["body"], "backend unavailable");
}

#[tokio::test]
async fn test_inbound_error_is_not_dispatched() {
    let server = test_server().await;
    let mut peer = connect(&server, "peer-A").await;

    send(&mut peer, "c1", "error", json!("client side failure")).await;
    sync(&mut peer).await;
    assert_silent(&mut peer).await;
}

#[tokio::test]
async fn test_malformed_envelope_closes_connection() {
    let server = test_server().await;
    let mut peer = connect(&server, "peer-A").await;
    sync(&mut peer).await;

    assert!(peer.send("not json").await);
    assert!(timeout(RECV_TIMEOUT, peer.recv()).await.unwrap().is_none());
    wait_for_connections(&server, 0).await;
}

#[tokio::test]
async fn test_empty_channel_closes_connection() {
    let server = test_server().await;
    let mut peer = connect(&server, "peer-A").await;
    sync(&mut peer).await;

    send(&mut peer, "", "ping", Value::Null).await;
    assert!(timeout(RECV_TIMEOUT, peer.recv()).await.unwrap().is_none());
    wait_for_connections(&server, 0).await;
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let config = ServerConfig {
        max_frame_size: 64,
        ..ServerConfig::default()
    };
    let server = Server::new(config, CancellationToken::new());
    let mut peer = connect(&server, "peer-A").await;

    send(&mut peer, "c1", "open", json!("x".repeat(100))).await;
    assert!(timeout(RECV_TIMEOUT, peer.recv()).await.unwrap().is_none());
    wait_for_connections(&server, 0).await;
}

// ============================================================================
// Drain and replacement
// ============================================================================

#[tokio::test]
async fn test_drain_waits_for_in_flight_handlers() {
    let server = test_server().await;
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        server
            .handle_fn("slow", move |_req, rw| {
                let started = Arc::clone(&started);
                let release = Arc::clone(&release);
                async move {
                    started.notify_one();
                    release.notified().await;
                    rw.write("done", &Value::Null).await;
                    Ok(())
                }
            })
            .await
            .unwrap();
    }

    let mut peer = connect(&server, "peer-A").await;
    send(&mut peer, "c1", "slow", Value::Null).await;
    timeout(RECV_TIMEOUT, started.notified()).await.unwrap();

    let conn = server.connection(&PeerId::new("peer-A")).await.unwrap();
    assert_eq!(conn.in_flight(), 1);

    peer.close();
    let start = Instant::now();
    while conn.state() != ConnectionState::Draining {
        assert!(start.elapsed() < WAIT_TIMEOUT, "connection never drained");
        sleep(POLL_INTERVAL).await;
    }

    // Still registered and holding its locks while the handler runs.
    sleep(SILENCE).await;
    assert_eq!(server.connection_count().await, 1);
    assert!(server.locks().contains("peer-A.io"));

    release.notify_one();
    let frame = recv(&mut peer).await;
    assert_eq!(frame["type"], "done");

    assert!(timeout(RECV_TIMEOUT, peer.recv()).await.unwrap().is_none());
    let start = Instant::now();
    while conn.state() != ConnectionState::Closed {
        assert!(start.elapsed() < WAIT_TIMEOUT, "connection never closed");
        sleep(POLL_INTERVAL).await;
    }
    assert_eq!(server.connection_count().await, 0);
    assert_eq!(server.locks().len(), 2);
}

#[tokio::test]
async fn test_duplicate_id_replaces_without_eviction() {
    let server = test_server().await;

    let mut first = connect(&server, "dup").await;
    sync(&mut first).await;
    let mut second = connect(&server, "dup").await;
    sync(&mut second).await;

    assert_eq!(server.connection_count().await, 1);
    assert_eq!(server.locks().len(), 6);

    // Targeted writes now reach the replacement only.
    assert!(server.write(&PeerId::new("dup"), "probe", "note", &1).await);
    assert_eq!(recv(&mut second).await["type"], "note");
    assert_silent(&mut first).await;

    first.close();
    wait_for_lock_count(&server, 4).await;

    assert_eq!(server.connection_count().await, 1);
    assert!(server.locks().contains("dup"));
    assert!(server.locks().contains("dup.io"));
    sync(&mut second).await;
}

#[tokio::test]
async fn test_disconnect_and_shutdown() {
    let server = test_server().await;
    let mut a = connect(&server, "peer-A").await;
    let mut b = connect(&server, "peer-B").await;
    sync(&mut a).await;
    sync(&mut b).await;

    assert!(server.disconnect(&PeerId::new("peer-A")).await);
    assert!(timeout(RECV_TIMEOUT, a.recv()).await.unwrap().is_none());
    wait_for_connections(&server, 1).await;

    timeout(WAIT_TIMEOUT, server.shutdown()).await.unwrap();
    assert_eq!(server.connection_count().await, 0);
    assert!(timeout(RECV_TIMEOUT, b.recv()).await.unwrap().is_none());
    assert_eq!(server.locks().len(), 2);
}

// ============================================================================
// Diagnostics
// ============================================================================

#[tokio::test]
async fn test_snapshot_reports_traffic_and_locks() {
    let server = test_server().await;
    let mut peer = connect(&server, "peer-A").await;
    send(&mut peer, "c1", "subscribe", json!("temps")).await;
    sync(&mut peer).await;
    server.publish("temps", "update", &1).await;
    recv(&mut peer).await;

    let snapshot = server.snapshot().await;
    let conn = snapshot.connection("peer-A").unwrap();
    assert_eq!(conn.state, ConnectionState::Open);
    assert_eq!(conn.stats.received, 2);
    assert_eq!(conn.stats.sent, 2);
    assert_eq!(conn.channel("c1").unwrap().stats.sent, 1);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["connections"][0]["id"], "peer-A");
    assert!(json["connections"][0]["stats"]["lastSent"].is_string());
    for key in ["server.clients", "server.handlers", "peer-A", "peer-A.io"] {
        assert_eq!(json["locks"][key]["readers"], 0, "{key}");
        assert_eq!(json["locks"][key]["writerHeld"], false, "{key}");
    }
}
