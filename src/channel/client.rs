//! WebSocket channel client with request correlation and event fan-out.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::wire::{self, Event, Inbound};
use crate::errors::{HarnessError, Result};

/// Floor on how quickly [`ChannelClient::closed`] may resolve after connect.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(3);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type EventHandler = Box<dyn FnMut(&Event) + Send>;
type PendingCalls = HashMap<u64, oneshot::Sender<Result<Value>>>;

enum Command {
    Invoke {
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    Subscribe(EventHandler),
}

/// Duplex request/response client over one WebSocket connection.
///
/// All socket I/O, correlation bookkeeping, and event dispatch happen in
/// a single connection task; the client hands it work over a command
/// channel. Dropping the client cancels the task, which fails any calls
/// still in flight.
pub struct ChannelClient {
    endpoint: String,
    commands: mpsc::Sender<Command>,
    closed: watch::Receiver<bool>,
    connected_at: Instant,
    close_grace: Duration,
    cancel: CancellationToken,
}

impl ChannelClient {
    /// Connect with [`DEFAULT_CLOSE_GRACE`].
    ///
    /// # Errors
    ///
    /// See [`connect_with_grace`](Self::connect_with_grace).
    pub async fn connect(endpoint: &str) -> Result<Self> {
        Self::connect_with_grace(endpoint, DEFAULT_CLOSE_GRACE).await
    }

    /// Connect to a conductor channel endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Connection`] naming the endpoint when the
    /// WebSocket handshake fails.
    pub async fn connect_with_grace(endpoint: &str, close_grace: Duration) -> Result<Self> {
        let (socket, _) = connect_async(endpoint).await.map_err(|err| {
            HarnessError::Connection(format!("connect to {endpoint} failed: {err}"))
        })?;
        debug!(endpoint, "channel connected");
        let (commands, command_rx) = mpsc::channel(32);
        let (closed_tx, closed) = watch::channel(false);
        let cancel = CancellationToken::new();
        tokio::spawn(run_connection(socket, command_rx, closed_tx, cancel.clone()));
        Ok(Self {
            endpoint: endpoint.to_owned(),
            commands,
            closed,
            connected_at: Instant::now(),
            close_grace,
            cancel,
        })
    }

    /// Endpoint this client connected to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The configured close grace.
    #[must_use]
    pub fn close_grace(&self) -> Duration {
        self.close_grace
    }

    /// Send one request and await its correlated response.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Remote`] when the endpoint answers with an
    /// error frame and [`HarnessError::Connection`] when the connection
    /// dies before a response arrives.
    pub async fn invoke(&self, method: &str, params: Value) -> Result<Value> {
        let (reply, response) = oneshot::channel();
        let command = Command::Invoke { method: method.to_owned(), params, reply };
        self.commands.send(command).await.map_err(|_| self.gone())?;
        response.await.map_err(|_| self.gone())?
    }

    /// Register a handler invoked once per inbound event, in arrival
    /// order, synchronously within the connection task.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Connection`] when the connection task is
    /// already gone.
    pub async fn on_event(&self, handler: impl FnMut(&Event) + Send + 'static) -> Result<()> {
        self.commands
            .send(Command::Subscribe(Box::new(handler)))
            .await
            .map_err(|_| self.gone())
    }

    /// Resolve once the socket has closed, but never before
    /// connect-time + close-grace.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
        tokio::time::sleep_until(self.connected_at + self.close_grace).await;
    }

    fn gone(&self) -> HarnessError {
        HarnessError::Connection(format!("channel to {} is closed", self.endpoint))
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_connection(
    socket: Socket,
    mut commands: mpsc::Receiver<Command>,
    closed_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    let (mut sink, mut stream) = socket.split();
    let mut pending: PendingCalls = HashMap::new();
    let mut handlers: Vec<EventHandler> = Vec::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            command = commands.recv() => match command {
                Some(Command::Invoke { method, params, reply }) => {
                    let id = next_id;
                    next_id += 1;
                    send_request(&mut sink, &mut pending, id, &method, params, reply).await;
                }
                Some(Command::Subscribe(handler)) => handlers.push(handler),
                None => break,
            },

            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => dispatch_frame(&text, &mut pending, &mut handlers),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "channel read failed");
                    break;
                }
            },
        }
    }

    for reply in std::mem::take(&mut pending).into_values() {
        let _ = reply.send(Err(HarnessError::Connection(
            "channel closed before a response arrived".into(),
        )));
    }
    let _ = closed_tx.send(true);
}

async fn send_request(
    sink: &mut SplitSink<Socket, Message>,
    pending: &mut PendingCalls,
    id: u64,
    method: &str,
    params: Value,
    reply: oneshot::Sender<Result<Value>>,
) {
    let frame = match wire::encode_request(id, method, &params) {
        Ok(frame) => frame,
        Err(err) => {
            let _ = reply.send(Err(err));
            return;
        }
    };
    pending.insert(id, reply);
    if let Err(err) = sink.send(Message::Text(frame)).await {
        if let Some(reply) = pending.remove(&id) {
            let _ = reply.send(Err(HarnessError::Connection(format!(
                "failed to send request: {err}"
            ))));
        }
    }
}

fn dispatch_frame(text: &str, pending: &mut PendingCalls, handlers: &mut [EventHandler]) {
    match wire::decode_frame(text) {
        Ok(Inbound::Response { id, outcome }) => match pending.remove(&id) {
            Some(reply) => {
                let _ = reply.send(outcome.map_err(HarnessError::Remote));
            }
            None => warn!(id, "response with no pending call, dropping"),
        },
        Ok(Inbound::Event(event)) => {
            for handler in handlers.iter_mut() {
                handler(&event);
            }
        }
        Err(err) => warn!(error = %err, "undecodable frame, dropping"),
    }
}
