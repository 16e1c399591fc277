//! One conductor: a runtime process plus its control and invocation
//! channels, driven through an explicit lifecycle state machine.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::channel::wire::Event;
use crate::channel::{ChannelClient, DEFAULT_CLOSE_GRACE};
use crate::errors::{HarnessError, Result};
use crate::process::{ProcessExit, ProcessHandle, TermSignal};

/// Default per-call timeout for zome invocations.
pub const DEFAULT_ZOME_CALL_TIMEOUT: Duration = Duration::from_millis(60_000);

/// A consistency signal emitted by one instance.
#[derive(Debug, Clone)]
pub struct ConsistencySignal {
    /// Instance that emitted the signal.
    pub instance_id: String,
    /// Raw signal payload.
    pub signal: Value,
}

/// Callback receiving every consistency signal from a conductor.
pub type SignalHandler = Arc<dyn Fn(ConsistencySignal) + Send + Sync>;

/// Lifecycle of a conductor session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process ready, channels not yet connected.
    Uninitialized,
    /// Control channel handshake in progress.
    ConnectingControl,
    /// Invocation channel handshake in progress.
    ConnectingInvocation,
    /// Both channels live; calls are allowed.
    Ready,
    /// Kill in progress.
    ShuttingDown,
    /// Process exited and channels released.
    Closed,
}

/// A running conductor process with its two channels.
pub struct ConductorSession {
    name: String,
    process: ProcessHandle,
    control_endpoint: String,
    invocation_endpoint: String,
    state: SessionState,
    control: Option<ChannelClient>,
    invocation: Option<ChannelClient>,
    zome_call_timeout: Duration,
    close_grace: Duration,
    on_signal: SignalHandler,
}

impl ConductorSession {
    /// Wrap a conductor process that has already passed readiness; the
    /// channels connect in [`initialize`](Self::initialize).
    #[must_use]
    pub fn new(
        name: &str,
        process: ProcessHandle,
        admin_port: u16,
        zome_port: u16,
        on_signal: SignalHandler,
    ) -> Self {
        Self {
            name: name.to_owned(),
            process,
            control_endpoint: format!("ws://localhost:{admin_port}"),
            invocation_endpoint: format!("ws://localhost:{zome_port}"),
            state: SessionState::Uninitialized,
            control: None,
            invocation: None,
            zome_call_timeout: DEFAULT_ZOME_CALL_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
            on_signal,
        }
    }

    /// Replace the default per-call zome timeout.
    #[must_use]
    pub fn with_zome_call_timeout(mut self, timeout: Duration) -> Self {
        self.zome_call_timeout = timeout;
        self
    }

    /// Replace the close grace used by [`kill`](Self::kill) and both
    /// channels.
    #[must_use]
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session name, the owning participant's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying process handle.
    #[must_use]
    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    /// Connect both channels and register the signal subscription.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Guard`] unless the session is
    /// `Uninitialized`, and [`HarnessError::Connection`] when either
    /// endpoint is unreachable. On failure the session stays in the
    /// connecting state it reached; [`kill`](Self::kill) still works.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Err(HarnessError::Guard(format!(
                "conductor '{}' cannot initialize from state {:?}",
                self.name, self.state
            )));
        }

        self.state = SessionState::ConnectingControl;
        debug!(conductor = %self.name, endpoint = %self.control_endpoint, "connecting control channel");
        let control =
            ChannelClient::connect_with_grace(&self.control_endpoint, self.close_grace).await?;
        let on_signal = Arc::clone(&self.on_signal);
        let name = self.name.clone();
        control
            .on_event(move |event| route_signal(&name, event, &on_signal))
            .await?;

        self.state = SessionState::ConnectingInvocation;
        debug!(conductor = %self.name, endpoint = %self.invocation_endpoint, "connecting invocation channel");
        let invocation =
            ChannelClient::connect_with_grace(&self.invocation_endpoint, self.close_grace).await?;

        self.control = Some(control);
        self.invocation = Some(invocation);
        self.state = SessionState::Ready;
        info!(conductor = %self.name, "conductor session ready");
        Ok(())
    }

    /// Issue an admin call on the control channel.
    ///
    /// Read-only admin methods follow the `admin/<noun>/list` shape; any
    /// other method logs a loud warning, because mutating conductor
    /// state mid-test invalidates metadata resolved at spawn.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Guard`] unless the session is `Ready`;
    /// otherwise whatever the channel reports.
    pub async fn call_admin(&self, method: &str, params: Value) -> Result<Value> {
        let control = self.ready_channel(&self.control, "control")?;
        if !is_admin_list_method(method) {
            warn!(
                conductor = %self.name,
                method,
                "admin method may modify conductor state; mid-test mutations cause unexpected behavior"
            );
        }
        debug!(conductor = %self.name, method, %params, "admin call");
        control.invoke(method, params).await
    }

    /// Invoke a zome function and decode its payload.
    ///
    /// The conductor returns the zome payload as a JSON-encoded string,
    /// which is parsed a second time before being returned.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::CallTimeout`] when the per-call timeout
    /// elapses, [`HarnessError::Decode`] when the payload is not a JSON
    /// string or fails the second parse, and [`HarnessError::Guard`]
    /// unless the session is `Ready`.
    pub async fn call_zome(
        &self,
        instance_id: &str,
        zome: &str,
        function: &str,
        args: Value,
    ) -> Result<Value> {
        let invocation = self.ready_channel(&self.invocation, "invocation")?;
        debug!(conductor = %self.name, instance_id, zome, function, "zome call");
        let params = serde_json::json!({
            "instance_id": instance_id,
            "zome": zome,
            "function": function,
            "args": args,
        });
        let response = timeout(self.zome_call_timeout, invocation.invoke("call", params))
            .await
            .map_err(|_| HarnessError::CallTimeout {
                instance_id: instance_id.to_owned(),
                zome: zome.to_owned(),
                function: function.to_owned(),
                waited: self.zome_call_timeout,
            })??;
        let encoded = response.as_str().ok_or_else(|| {
            HarnessError::Decode(format!(
                "zome call {instance_id}/{zome}/{function} returned a non-string payload"
            ))
        })?;
        serde_json::from_str(encoded).map_err(|err| {
            HarnessError::Decode(format!(
                "zome call {instance_id}/{zome}/{function} payload is not valid JSON: {err}"
            ))
        })
    }

    /// Signal the process and wait for teardown.
    ///
    /// Resolves once the process has exited AND the control channel has
    /// closed or the close grace has elapsed, whichever of those two is
    /// first. A signalled-but-hung process therefore blocks this call;
    /// tests must observe real teardown.
    pub async fn kill(&mut self, signal: TermSignal) -> ProcessExit {
        if self.state == SessionState::Closed {
            warn!(conductor = %self.name, "kill on an already closed session");
            return self.process.wait().await;
        }
        let from = self.state;
        self.state = SessionState::ShuttingDown;
        info!(conductor = %self.name, ?signal, ?from, "killing conductor");
        self.process.signal(signal);

        let exit = match self.control.take() {
            Some(control) => {
                let grace = sleep(self.close_grace);
                let (exit, ()) = tokio::join!(self.process.wait(), async {
                    tokio::select! {
                        () = control.closed() => {}
                        () = grace => {}
                    }
                });
                exit
            }
            None => self.process.wait().await,
        };

        self.invocation = None;
        self.state = SessionState::Closed;
        info!(conductor = %self.name, code = ?exit.code, "conductor closed");
        exit
    }

    fn ready_channel<'a>(
        &'a self,
        channel: &'a Option<ChannelClient>,
        which: &str,
    ) -> Result<&'a ChannelClient> {
        match (self.state, channel) {
            (SessionState::Ready, Some(channel)) => Ok(channel),
            _ => Err(HarnessError::Guard(format!(
                "conductor '{}' has no live {which} channel in state {:?}",
                self.name, self.state
            ))),
        }
    }
}

// ── Signal routing ────────────────────────────────────────────────────────────

fn route_signal(conductor: &str, event: &Event, on_signal: &SignalHandler) {
    if event.method != "signal" {
        return;
    }
    let instance_id = event.params.get("instance_id").and_then(Value::as_str);
    let signal = event.params.get("signal");
    let (Some(instance_id), Some(signal)) = (instance_id, signal) else {
        warn!(conductor, "signal event with unexpected shape, dropping");
        return;
    };
    let kind = signal.get("signal_type").and_then(Value::as_str);
    if kind != Some("Consistency") {
        debug!(conductor, ?kind, "ignoring non-consistency signal");
        return;
    }
    on_signal(ConsistencySignal {
        instance_id: instance_id.to_owned(),
        signal: signal.clone(),
    });
}

fn is_admin_list_method(method: &str) -> bool {
    method
        .strip_prefix("admin/")
        .is_some_and(|rest| rest.ends_with("/list"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
