//! Shared test helpers for harness integration tests.
//!
//! Provides a scriptable WebSocket stand-in for a conductor's channel
//! interfaces, shell-script process spawners, and counting lifecycle
//! hooks so individual test modules can focus on behaviour rather than
//! plumbing.

use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use troupe::conductor::{ConsistencySignal, SignalHandler};
use troupe::config::GenConfigArgs;
use troupe::participant::{ConductorSpawner, ParticipantHooks, STARTUP_LINE};
use troupe::process::ProcessHandle;
use troupe::Result;

// ── Stub channel server ───────────────────────────────────────────────────────

/// How the stub answers one request.
pub enum ServerReply {
    /// Respond with a result payload.
    Result(Value),
    /// Respond with an error payload.
    Error(Value),
    /// Respond with a result payload after a delay, without blocking
    /// later requests.
    DelayedResult(Value, Duration),
    /// Never respond.
    Ignore,
}

/// Maps `(method, params)` of an incoming request to a reply.
pub type Responder = Arc<dyn Fn(&str, &Value) -> ServerReply + Send + Sync>;

type StubSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Serve a stub channel on an ephemeral port, returning the port.
///
/// `events` are raw frames written once per connection, right after the
/// first request has been answered; by then the client has its event
/// handlers registered.
pub async fn serve_ws(responder: Responder, events: Vec<Value>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub listener");
    let port = listener.local_addr().expect("stub local addr").port();
    accept_loop(listener, responder, events);
    port
}

/// Serve a stub channel on a specific port.
pub async fn serve_ws_on(port: u16, responder: Responder, events: Vec<Value>) {
    let listener =
        TcpListener::bind(("127.0.0.1", port)).await.expect("bind stub listener on fixed port");
    accept_loop(listener, responder, events);
}

/// Accept one connection, keep it open for `after`, then drop it.
pub async fn serve_ws_hangup(after: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub listener");
    let port = listener.local_addr().expect("stub local addr").port();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else { return };
        let Ok(socket) = accept_async(stream).await else { return };
        tokio::time::sleep(after).await;
        drop(socket);
    });
    port
}

fn accept_loop(listener: TcpListener, responder: Responder, events: Vec<Value>) {
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let responder = Arc::clone(&responder);
            let events = events.clone();
            tokio::spawn(async move {
                let Ok(socket) = accept_async(stream).await else { return };
                drive_connection(socket, responder, events).await;
            });
        }
    });
}

async fn drive_connection(
    socket: WebSocketStream<TcpStream>,
    responder: Responder,
    events: Vec<Value>,
) {
    let (sink, mut stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));
    let mut emitted = false;
    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else { continue };
        let (Some(id), Some(method)) =
            (frame.get("id").cloned(), frame.get("method").and_then(Value::as_str))
        else {
            continue;
        };
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        match responder(method, &params) {
            ServerReply::Result(value) => {
                send_json(&sink, json!({ "id": id, "result": value })).await;
            }
            ServerReply::Error(value) => {
                send_json(&sink, json!({ "id": id, "error": value })).await;
            }
            ServerReply::DelayedResult(value, delay) => {
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    send_json(&sink, json!({ "id": id, "result": value })).await;
                });
            }
            ServerReply::Ignore => {}
        }
        if !emitted {
            emitted = true;
            for event in &events {
                send_json(&sink, event.clone()).await;
            }
        }
    }
}

async fn send_json(sink: &Arc<Mutex<StubSink>>, frame: Value) {
    let Ok(text) = serde_json::to_string(&frame) else { return };
    let _ = sink.lock().await.send(Message::Text(text)).await;
}

// ── Canned behaviours ─────────────────────────────────────────────────────────

/// Responder covering the three metadata lists plus zome calls that
/// echo the called function inside a double-encoded `Ok` payload.
pub fn metadata_responder() -> Responder {
    Arc::new(|method, params| match method {
        "admin/agent/list" => ServerReply::Result(json!([
            { "id": "agent-1", "public_address": "HcAgentAddr001" }
        ])),
        "admin/dna/list" => ServerReply::Result(json!([
            { "id": "passthrough-dna", "hash": "QmDnaHash001" }
        ])),
        "admin/instance/list" => ServerReply::Result(json!([
            { "id": "app", "agent": "agent-1", "dna": "passthrough-dna" }
        ])),
        "call" => {
            let payload = json!({ "Ok": params["function"].as_str().unwrap_or("?") });
            ServerReply::Result(Value::String(payload.to_string()))
        }
        _ => ServerReply::Result(Value::Null),
    })
}

/// A signal frame the session must forward.
pub fn consistency_event(instance_id: &str) -> Value {
    json!({
        "method": "signal",
        "params": {
            "instance_id": instance_id,
            "signal": { "signal_type": "Consistency", "event": "hold", "pending": [] }
        }
    })
}

/// A signal frame the session must drop.
pub fn user_signal_event(instance_id: &str) -> Value {
    json!({
        "method": "signal",
        "params": {
            "instance_id": instance_id,
            "signal": { "signal_type": "User", "name": "post_created" }
        }
    })
}

// ── Process and spawner stand-ins ─────────────────────────────────────────────

/// Shell one-liner that prints the readiness marker and then idles.
pub fn ready_script() -> String {
    format!("echo '{STARTUP_LINE}'; exec sleep 600")
}

/// Spawner that runs a fixed shell script instead of a conductor.
pub struct ScriptSpawner {
    pub script: String,
}

impl ConductorSpawner for ScriptSpawner {
    fn spawn(
        &self,
        name: &str,
        _config_path: &Path,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<ProcessHandle>> + Send + '_>> {
        let handle = ProcessHandle::start(name, Path::new("sh"), &["-c", &self.script]);
        Box::pin(async move { handle })
    }
}

/// Spawner that reads the generated conductor config, serves stub
/// channels on the ports it declares, and launches a ready shell
/// process in place of the conductor binary.
pub struct StubConductorSpawner {
    responder: Responder,
    events: Vec<Value>,
}

impl StubConductorSpawner {
    pub fn new(responder: Responder, events: Vec<Value>) -> Self {
        Self { responder, events }
    }
}

impl ConductorSpawner for StubConductorSpawner {
    fn spawn(
        &self,
        name: &str,
        config_path: &Path,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<ProcessHandle>> + Send + '_>> {
        let responder = Arc::clone(&self.responder);
        let events = self.events.clone();
        let name = name.to_owned();
        let config_path = config_path.to_path_buf();
        Box::pin(async move {
            let raw = std::fs::read_to_string(&config_path)?;
            let document: toml::Value = toml::from_str(&raw)?;
            let interfaces = document
                .get("interfaces")
                .and_then(toml::Value::as_array)
                .cloned()
                .unwrap_or_default();
            for interface in interfaces {
                let Some(port) = interface
                    .get("driver")
                    .and_then(|driver| driver.get("port"))
                    .and_then(toml::Value::as_integer)
                else {
                    continue;
                };
                let port = u16::try_from(port).expect("interface port fits in u16");
                serve_ws_on(port, Arc::clone(&responder), events.clone()).await;
            }
            ProcessHandle::start(&name, Path::new("sh"), &["-c", &ready_script()])
        })
    }
}

// ── Hooks and signal collection ───────────────────────────────────────────────

/// Lifecycle hooks that count their invocations.
#[derive(Default)]
pub struct CountingHooks {
    pub joins: AtomicUsize,
    pub leaves: AtomicUsize,
}

impl ParticipantHooks for CountingHooks {
    fn on_join(
        &self,
        _name: &str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn on_leave(
        &self,
        _name: &str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Signal handler that appends every forwarded signal to a shared list.
pub fn signal_collector() -> (SignalHandler, Arc<std::sync::Mutex<Vec<ConsistencySignal>>>) {
    let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let handler: SignalHandler = Arc::new(move |signal| {
        sink.lock().expect("collector lock").push(signal);
    });
    (handler, collected)
}

/// Config-generation arguments pointing a participant at stub ports.
pub fn stub_args(dir: &Path, admin_port: u16, zome_port: u16) -> GenConfigArgs {
    GenConfigArgs {
        conductor_name: "stub".into(),
        uuid: "test-uuid".into(),
        config_dir: dir.to_path_buf(),
        admin_port,
        zome_port,
    }
}
