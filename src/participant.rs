//! Named participants: each owns at most one live conductor session.
//!
//! Spawn and kill are idempotent with warnings rather than errors, so
//! sloppy scenario code cannot double-launch a conductor. Everything
//! else that needs a live session fails with a guard error naming the
//! attempted action.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::channel::DEFAULT_CLOSE_GRACE;
use crate::conductor::{ConductorSession, SessionState, SignalHandler, DEFAULT_ZOME_CALL_TIMEOUT};
use crate::config::{self, GenConfigArgs};
use crate::errors::{HarnessError, Result};
use crate::process::{ProcessHandle, TermSignal};

/// Line a conductor prints once all its interfaces are listening.
pub const STARTUP_LINE: &str = "Starting interfaces...";

/// Default deadline for the readiness marker.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolved addresses for one configured instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    /// Public address of the agent running the instance.
    pub agent_address: String,
    /// Hash of the DNA the instance runs.
    pub dna_address: String,
}

/// Launches conductor processes for participants.
pub trait ConductorSpawner: Send + Sync {
    /// Launch the conductor for `name` with the given config file.
    fn spawn(
        &self,
        name: &str,
        config_path: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessHandle>> + Send + '_>>;
}

/// Spawner invoking a conductor executable as `<executable> <config-path>`.
#[derive(Debug, Clone)]
pub struct ExecSpawner {
    /// Conductor executable to launch.
    pub executable: PathBuf,
}

impl ConductorSpawner for ExecSpawner {
    fn spawn(
        &self,
        name: &str,
        config_path: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessHandle>> + Send + '_>> {
        let handle = ProcessHandle::start(name, &self.executable, &[config_path]);
        Box::pin(async move { handle })
    }
}

/// Scenario lifecycle hooks run around spawn and kill.
pub trait ParticipantHooks: Send + Sync {
    /// Runs before the conductor process is launched; an error aborts
    /// the spawn.
    fn on_join(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Runs after the conductor has been killed.
    fn on_leave(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ParticipantHooks for NoopHooks {
    fn on_join(&self, _name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn on_leave(&self, _name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// A named participant owning at most one live conductor session.
pub struct Participant {
    name: String,
    args: GenConfigArgs,
    spawner: Arc<dyn ConductorSpawner>,
    hooks: Arc<dyn ParticipantHooks>,
    on_signal: SignalHandler,
    session: Option<ConductorSession>,
    instances: HashMap<String, InstanceInfo>,
    startup_timeout: Duration,
    zome_call_timeout: Duration,
    close_grace: Duration,
}

impl Participant {
    /// Create an empty participant slot.
    #[must_use]
    pub fn new(
        name: &str,
        args: GenConfigArgs,
        spawner: Arc<dyn ConductorSpawner>,
        hooks: Arc<dyn ParticipantHooks>,
        on_signal: SignalHandler,
    ) -> Self {
        Self {
            name: name.to_owned(),
            args,
            spawner,
            hooks,
            on_signal,
            session: None,
            instances: HashMap::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            zome_call_timeout: DEFAULT_ZOME_CALL_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }

    /// Replace the readiness deadline.
    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Replace the per-call zome timeout.
    #[must_use]
    pub fn with_zome_call_timeout(mut self, timeout: Duration) -> Self {
        self.zome_call_timeout = timeout;
        self
    }

    /// Replace the close grace used during teardown.
    #[must_use]
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Participant name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Config-generation arguments this participant was built with.
    #[must_use]
    pub fn args(&self) -> &GenConfigArgs {
        &self.args
    }

    /// Whether a conductor session is currently attached.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Lifecycle state of the attached session, when one exists.
    #[must_use]
    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(ConductorSession::state)
    }

    /// Launch and initialize this participant's conductor.
    ///
    /// Spawning while a conductor is already running logs a warning and
    /// changes nothing.
    ///
    /// # Errors
    ///
    /// Whatever the failing stage reports: join hook, launch, readiness,
    /// channel connect, or metadata resolution. A process launched by a
    /// failed spawn is killed before the error propagates, so failures
    /// never leak children.
    pub async fn spawn(&mut self) -> Result<()> {
        self.spawn_with(|_| {}).await
    }

    /// Like [`spawn`](Self::spawn), exposing the raw process handle
    /// between launch and the readiness scan.
    ///
    /// # Errors
    ///
    /// See [`spawn`](Self::spawn).
    pub async fn spawn_with(&mut self, inspect: impl FnOnce(&ProcessHandle)) -> Result<()> {
        if self.session.is_some() {
            warn!(participant = %self.name, "attempted to spawn conductor twice, keeping the running one");
            return Ok(());
        }
        self.hooks.on_join(&self.name).await?;

        let config_path = config::config_path(&self.args.config_dir);
        info!(participant = %self.name, config = %config_path.display(), "spawning conductor");
        let mut process = self.spawner.spawn(&self.name, &config_path).await?;
        inspect(&process);

        if let Err(err) = process.await_ready(STARTUP_LINE, self.startup_timeout).await {
            process.signal(TermSignal::Kill);
            process.wait().await;
            return Err(err);
        }
        debug!(participant = %self.name, "conductor ready, connecting channels");

        let mut session = ConductorSession::new(
            &self.name,
            process,
            self.args.admin_port,
            self.args.zome_port,
            Arc::clone(&self.on_signal),
        )
        .with_zome_call_timeout(self.zome_call_timeout)
        .with_close_grace(self.close_grace);

        if let Err(err) = session.initialize().await {
            session.kill(TermSignal::Kill).await;
            return Err(err);
        }
        match resolve_instances(&session).await {
            Ok(instances) => {
                self.instances = instances;
                self.session = Some(session);
                info!(participant = %self.name, instances = self.instances.len(), "conductor running");
                Ok(())
            }
            Err(err) => {
                session.kill(TermSignal::Kill).await;
                Err(err)
            }
        }
    }

    /// Kill this participant's conductor (SIGINT) and run the leave hook.
    ///
    /// The session is detached from the slot before anything awaits, so
    /// a participant mid-kill is already "not running". Killing while
    /// nothing runs logs a warning and changes nothing.
    ///
    /// # Errors
    ///
    /// Propagates leave-hook failures.
    pub async fn kill(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            warn!(participant = %self.name, "attempted to kill conductor twice, nothing is running");
            return Ok(());
        };
        info!(participant = %self.name, "killing conductor");
        let exit = session.kill(TermSignal::Interrupt).await;
        debug!(participant = %self.name, code = ?exit.code, "conductor killed");
        self.hooks.on_leave(&self.name).await?;
        Ok(())
    }

    /// Issue an admin call against this conductor.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Guard`] when nothing is running;
    /// otherwise whatever the session reports.
    pub async fn admin(&self, method: &str, params: Value) -> Result<Value> {
        let session = self.guard(&format!("admin({method})"))?;
        session.call_admin(method, params).await
    }

    /// Invoke a zome function on one of this conductor's instances.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Guard`] when nothing is running;
    /// otherwise whatever the session reports.
    pub async fn call(
        &self,
        instance_id: &str,
        zome: &str,
        function: &str,
        args: Value,
    ) -> Result<Value> {
        let session = self.guard(&format!("call({instance_id}/{zome}/{function})"))?;
        session.call_zome(instance_id, zome, function, args).await
    }

    /// Resolved metadata for one instance, as a fresh copy.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Guard`] when nothing is running or the
    /// instance id is unknown.
    pub fn info(&self, instance_id: &str) -> Result<InstanceInfo> {
        let _ = self.guard(&format!("info({instance_id})"))?;
        self.instances.get(instance_id).cloned().ok_or_else(|| {
            HarnessError::Guard(format!(
                "participant '{}' has no instance '{instance_id}'",
                self.name
            ))
        })
    }

    fn guard(&self, action: &str) -> Result<&ConductorSession> {
        match &self.session {
            Some(session) => Ok(session),
            None => {
                error!(participant = %self.name, action, "action without a running conductor");
                Err(HarnessError::Guard(format!(
                    "no conductor is running for participant '{}'; spawn() first (attempted: {action})",
                    self.name
                )))
            }
        }
    }
}

// ── Metadata resolution ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AgentRecord {
    id: String,
    public_address: String,
}

#[derive(Debug, Deserialize)]
struct DnaRecord {
    id: String,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct InstanceRecord {
    id: String,
    agent: String,
    dna: String,
}

/// Cross-reference the conductor's agent, DNA, and instance lists into
/// per-instance addresses. Dangling references abort the spawn.
async fn resolve_instances(
    session: &ConductorSession,
) -> Result<HashMap<String, InstanceInfo>> {
    let agents: Vec<AgentRecord> = listed(session, "admin/agent/list").await?;
    let dnas: Vec<DnaRecord> = listed(session, "admin/dna/list").await?;
    let instances: Vec<InstanceRecord> = listed(session, "admin/instance/list").await?;

    let mut resolved = HashMap::with_capacity(instances.len());
    for instance in instances {
        let agent = agents
            .iter()
            .find(|agent| agent.id == instance.agent)
            .ok_or_else(|| {
                HarnessError::ReferentialIntegrity(format!(
                    "instance '{}' refers to nonexistent agent id '{}'",
                    instance.id, instance.agent
                ))
            })?;
        let dna = dnas
            .iter()
            .find(|dna| dna.id == instance.dna)
            .ok_or_else(|| {
                HarnessError::ReferentialIntegrity(format!(
                    "instance '{}' refers to nonexistent DNA id '{}'",
                    instance.id, instance.dna
                ))
            })?;
        resolved.insert(
            instance.id,
            InstanceInfo {
                agent_address: agent.public_address.clone(),
                dna_address: dna.hash.clone(),
            },
        );
    }
    Ok(resolved)
}

async fn listed<T: serde::de::DeserializeOwned>(
    session: &ConductorSession,
    method: &str,
) -> Result<T> {
    let raw = session.call_admin(method, json!({})).await?;
    serde_json::from_value(raw)
        .map_err(|err| HarnessError::Decode(format!("unexpected payload from {method}: {err}")))
}
