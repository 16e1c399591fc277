//! Integration tests for the duplex channel client against a stub
//! WebSocket server: request/response correlation, remote errors,
//! event delivery, and close semantics.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use troupe::channel::ChannelClient;
use troupe::HarnessError;

use super::test_helpers::{serve_ws, serve_ws_hangup, Responder, ServerReply};

fn echo_responder() -> Responder {
    Arc::new(|_method, params| ServerReply::Result(params.clone()))
}

async fn connect(port: u16) -> ChannelClient {
    ChannelClient::connect(&format!("ws://127.0.0.1:{port}")).await.expect("connect to stub")
}

// ── Request/response ──────────────────────────────────────────────────────────

#[tokio::test]
async fn invoke_resolves_with_the_result_payload() {
    let port = serve_ws(echo_responder(), Vec::new()).await;
    let client = connect(port).await;

    let result = client.invoke("echo", json!({ "n": 1 })).await.expect("invoke");
    assert_eq!(result, json!({ "n": 1 }));
}

#[tokio::test]
async fn remote_errors_surface_with_their_payload() {
    let responder: Responder =
        Arc::new(|_method, _params| ServerReply::Error(json!({ "code": -32000, "message": "boom" })));
    let port = serve_ws(responder, Vec::new()).await;
    let client = connect(port).await;

    let err = client.invoke("explode", json!({})).await.expect_err("remote error");
    let HarnessError::Remote(payload) = err else {
        panic!("expected a remote error, got {err}");
    };
    assert_eq!(payload["message"], "boom");
}

#[tokio::test]
async fn concurrent_invokes_correlate_out_of_order_responses() {
    let responder: Responder = Arc::new(|_method, params| {
        if params["lane"] == "slow" {
            ServerReply::DelayedResult(json!("slow"), Duration::from_millis(200))
        } else {
            ServerReply::Result(json!("fast"))
        }
    });
    let port = serve_ws(responder, Vec::new()).await;
    let client = connect(port).await;

    let (slow, fast) = tokio::join!(
        client.invoke("lane", json!({ "lane": "slow" })),
        client.invoke("lane", json!({ "lane": "fast" })),
    );
    assert_eq!(slow.expect("slow lane"), json!("slow"));
    assert_eq!(fast.expect("fast lane"), json!("fast"));
}

#[tokio::test]
async fn unknown_response_ids_are_dropped_without_breaking_the_channel() {
    let stray = json!({ "id": 4096, "result": "nobody asked" });
    let port = serve_ws(echo_responder(), vec![stray]).await;
    let client = connect(port).await;

    let first = client.invoke("echo", json!({ "seq": 1 })).await.expect("first call");
    assert_eq!(first, json!({ "seq": 1 }));
    let second = client.invoke("echo", json!({ "seq": 2 })).await.expect("second call");
    assert_eq!(second, json!({ "seq": 2 }));
}

// ── Events ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn subscribed_handlers_receive_events() {
    let event = json!({ "method": "signal", "params": { "instance_id": "app" } });
    let port = serve_ws(echo_responder(), vec![event]).await;
    let client = connect(port).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client
        .on_event(move |event| {
            sink.lock().expect("event lock").push(event.method.clone());
        })
        .await
        .expect("subscribe");

    client.invoke("echo", json!({})).await.expect("invoke");
    tokio::time::sleep(Duration::from_millis(150)).await;

    let methods = seen.lock().expect("event lock");
    assert_eq!(methods.len(), 1);
    assert_eq!(methods[0], "signal");
}

// ── Close semantics ───────────────────────────────────────────────────────────

#[tokio::test]
async fn closed_is_floored_by_the_connect_grace() {
    let port = serve_ws_hangup(Duration::from_millis(50)).await;
    let client =
        ChannelClient::connect_with_grace(&format!("ws://127.0.0.1:{port}"), Duration::from_millis(400))
            .await
            .expect("connect to stub");
    let started = Instant::now();

    client.closed().await;

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(350),
        "closed resolved after {elapsed:?}, before the grace floor"
    );
}

#[tokio::test]
async fn closed_stays_pending_while_the_socket_is_open() {
    let port = serve_ws(echo_responder(), Vec::new()).await;
    let client =
        ChannelClient::connect_with_grace(&format!("ws://127.0.0.1:{port}"), Duration::from_millis(50))
            .await
            .expect("connect to stub");

    let outcome = tokio::time::timeout(Duration::from_millis(300), client.closed()).await;
    assert!(outcome.is_err(), "closed must not resolve while the server keeps the socket open");
}

#[tokio::test]
async fn invoke_after_hangup_reports_a_closed_channel() {
    let port = serve_ws_hangup(Duration::from_millis(10)).await;
    let client = connect(port).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = client.invoke("echo", json!({})).await.expect_err("channel is gone");
    assert!(matches!(err, HarnessError::Connection(_)));
    assert!(err.to_string().contains("closed"));
}
