//! Scenario registration and orchestration.
//!
//! An [`Orchestrator`] collects named scenarios and runs them one after
//! another. Each scenario receives a fresh [`ScenarioApi`] that creates
//! participants from conductor configs; the orchestrator tears the
//! network down after every scenario, pass or fail, so one failure
//! never leaks processes into the next run.

use std::collections::HashMap;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::DEFAULT_CLOSE_GRACE;
use crate::conductor::{ConsistencySignal, SignalHandler, DEFAULT_ZOME_CALL_TIMEOUT};
use crate::config::{self, default_dna_hasher, ConductorConfig, DnaHasher, GenConfigArgs};
use crate::errors::{HarnessError, Result};
use crate::participant::{
    ConductorSpawner, NoopHooks, Participant, ParticipantHooks, DEFAULT_STARTUP_TIMEOUT,
};
use crate::util;

/// A registered scenario body.
pub type ScenarioFn = Box<
    dyn for<'a> Fn(&'a mut ScenarioApi) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>
        + Send,
>;

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Collects scenarios plus the knobs shared by every run.
pub struct Orchestrator {
    spawner: Arc<dyn ConductorSpawner>,
    hooks: Arc<dyn ParticipantHooks>,
    on_signal: SignalHandler,
    dna_hasher: DnaHasher,
    startup_timeout: Duration,
    zome_call_timeout: Duration,
    close_grace: Duration,
    scenarios: Vec<(String, ScenarioFn)>,
}

impl Orchestrator {
    /// Orchestrator with default hooks, signal handling, and timeouts.
    #[must_use]
    pub fn new(spawner: Arc<dyn ConductorSpawner>) -> Self {
        Self {
            spawner,
            hooks: Arc::new(NoopHooks),
            on_signal: Arc::new(|_| {}),
            dna_hasher: default_dna_hasher(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            zome_call_timeout: DEFAULT_ZOME_CALL_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
            scenarios: Vec::new(),
        }
    }

    /// Replace the lifecycle hooks run around each participant.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn ParticipantHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the handler invoked for every consistency signal.
    #[must_use]
    pub fn with_signal_handler(
        mut self,
        handler: impl Fn(ConsistencySignal) + Send + Sync + 'static,
    ) -> Self {
        self.on_signal = Arc::new(handler);
        self
    }

    /// Replace the DNA hasher used during config generation.
    #[must_use]
    pub fn with_dna_hasher(mut self, hasher: DnaHasher) -> Self {
        self.dna_hasher = hasher;
        self
    }

    /// Replace the readiness deadline for spawned conductors.
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

    /// Register a scenario to run under `description`.
    pub fn register_scenario<F>(&mut self, description: &str, scenario: F)
    where
        F: for<'a> Fn(&'a mut ScenarioApi) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>
            + Send
            + 'static,
    {
        self.scenarios.push((description.to_owned(), Box::new(scenario)));
    }

    /// Run every registered scenario in registration order.
    ///
    /// Running drains the registered list. Each scenario gets a fresh
    /// uuid and participant set, and its network is torn down before
    /// the next scenario starts.
    pub async fn run(&mut self) -> RunReport {
        let scenarios = mem::take(&mut self.scenarios);
        let mut outcomes = Vec::with_capacity(scenarios.len());
        for (description, scenario) in scenarios {
            info!(scenario = %description, "running scenario");
            let mut api = ScenarioApi {
                description: description.clone(),
                uuid: Uuid::new_v4().to_string(),
                spawner: Arc::clone(&self.spawner),
                hooks: Arc::clone(&self.hooks),
                on_signal: Arc::clone(&self.on_signal),
                dna_hasher: Arc::clone(&self.dna_hasher),
                startup_timeout: self.startup_timeout,
                zome_call_timeout: self.zome_call_timeout,
                close_grace: self.close_grace,
                participants: HashMap::new(),
                order: Vec::new(),
                config_dirs: Vec::new(),
            };
            let result = scenario(&mut api).await;
            api.teardown().await;
            match &result {
                Ok(()) => info!(scenario = %description, "scenario passed"),
                Err(err) => error!(scenario = %description, error = %err, "scenario failed"),
            }
            outcomes.push(ScenarioOutcome { description, result });
        }
        RunReport { outcomes }
    }
}

/// Result of one scenario.
#[derive(Debug)]
pub struct ScenarioOutcome {
    /// The scenario's registered description.
    pub description: String,
    /// What the scenario body returned.
    pub result: Result<()>,
}

/// Results of an orchestrator run.
#[derive(Debug)]
pub struct RunReport {
    /// Per-scenario outcomes in registration order.
    pub outcomes: Vec<ScenarioOutcome>,
}

impl RunReport {
    /// Number of scenarios that passed.
    #[must_use]
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|outcome| outcome.result.is_ok()).count()
    }

    /// Number of scenarios that failed.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.passed()
    }
}

// ── Scenario API ──────────────────────────────────────────────────────────────

/// Per-scenario handle for creating participants and tearing them down.
pub struct ScenarioApi {
    description: String,
    uuid: String,
    spawner: Arc<dyn ConductorSpawner>,
    hooks: Arc<dyn ParticipantHooks>,
    on_signal: SignalHandler,
    dna_hasher: DnaHasher,
    startup_timeout: Duration,
    zome_call_timeout: Duration,
    close_grace: Duration,
    participants: HashMap<String, Participant>,
    order: Vec<String>,
    config_dirs: Vec<TempDir>,
}

impl ScenarioApi {
    /// The scenario's registered description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Uuid unique to this scenario run, mixed into generated agent
    /// names.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Create one participant per `(name, config)` pair.
    ///
    /// Each participant gets its own temp config dir and two freshly
    /// allocated local ports; the rendered config is written before the
    /// participant exists. With `start` set, each conductor is spawned
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Guard`] for a duplicate participant
    /// name, plus any config-generation or spawn failure.
    pub async fn players<I, S>(&mut self, configs: I, start: bool) -> Result<()>
    where
        I: IntoIterator<Item = (S, ConductorConfig)>,
        S: Into<String>,
    {
        for (name, conductor) in configs {
            let name = name.into();
            if self.participants.contains_key(&name) {
                return Err(HarnessError::Guard(format!(
                    "participant '{name}' is already defined in this scenario"
                )));
            }
            let dir = tempfile::tempdir()?;
            let args = GenConfigArgs {
                conductor_name: name.clone(),
                uuid: self.uuid.clone(),
                config_dir: dir.path().to_path_buf(),
                admin_port: util::free_local_port()?,
                zome_port: util::free_local_port()?,
            };
            let path = config::write_config(&conductor, &args, &self.dna_hasher)?;
            debug!(participant = %name, config = %path.display(), "wrote conductor config");

            let mut participant = Participant::new(
                &name,
                args,
                Arc::clone(&self.spawner),
                Arc::clone(&self.hooks),
                Arc::clone(&self.on_signal),
            )
            .with_startup_timeout(self.startup_timeout)
            .with_zome_call_timeout(self.zome_call_timeout)
            .with_close_grace(self.close_grace);
            if start {
                participant.spawn().await?;
            }

            self.config_dirs.push(dir);
            self.order.push(name.clone());
            self.participants.insert(name, participant);
        }
        Ok(())
    }

    /// Look up a participant by name.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Guard`] for an unknown name.
    pub fn participant(&self, name: &str) -> Result<&Participant> {
        self.participants.get(name).ok_or_else(|| {
            HarnessError::Guard(format!("no participant '{name}' in this scenario"))
        })
    }

    /// Look up a participant by name, mutably.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Guard`] for an unknown name.
    pub fn participant_mut(&mut self, name: &str) -> Result<&mut Participant> {
        self.participants.get_mut(name).ok_or_else(|| {
            HarnessError::Guard(format!("no participant '{name}' in this scenario"))
        })
    }

    /// Wait for the test network to reach consistency.
    ///
    /// No consistency middleware ships with the harness yet, so this
    /// logs a warning and returns immediately. Register a signal
    /// handler and track [`ConsistencySignal`]s for real coordination.
    pub async fn consistency(&self) {
        warn!(
            scenario = %self.description,
            "consistency() called without middleware, returning immediately"
        );
    }

    /// Kill every running participant in registration order.
    ///
    /// Failures are logged, not propagated, so one stuck conductor
    /// cannot leak the rest of the network.
    pub async fn teardown(&mut self) {
        for name in mem::take(&mut self.order) {
            let Some(mut participant) = self.participants.remove(&name) else {
                continue;
            };
            if !participant.is_running() {
                continue;
            }
            if let Err(err) = participant.kill().await {
                warn!(participant = %name, error = %err, "teardown kill failed");
            }
        }
        self.config_dirs.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
