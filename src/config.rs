//! Conductor config generation.
//!
//! Scenario code describes conductors in a sugared form: instances as a
//! map from instance id to the DNA it runs. Generation desugars that
//! into explicit instances with per-test agents, dedupes agents and
//! DNAs, lays out the two channel interfaces, and renders the full
//! conductor TOML document.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::errors::{HarnessError, Result};

/// Config file name inside each conductor's config dir.
pub const CONFIG_FILE_NAME: &str = "conductor-config.toml";

/// Per-conductor generation inputs.
#[derive(Debug, Clone)]
pub struct GenConfigArgs {
    /// Participant name, doubling as the conductor name.
    pub conductor_name: String,
    /// Scenario-unique uuid mixed into generated agent names.
    pub uuid: String,
    /// Directory the config file and conductor state live in.
    pub config_dir: PathBuf,
    /// Control (admin) interface port.
    pub admin_port: u16,
    /// Invocation (zome) interface port.
    pub zome_port: u16,
}

/// One DNA available to instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnaConfig {
    /// Conductor-local DNA id.
    pub id: String,
    /// Path to the DNA file.
    pub file: String,
    /// Optional uuid forking the DNA.
    pub uuid: Option<String>,
}

impl DnaConfig {
    /// Replace the id derived from the file path.
    #[must_use]
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_owned();
        self
    }

    /// Fork the DNA with a uuid.
    #[must_use]
    pub fn with_uuid(mut self, uuid: &str) -> Self {
        self.uuid = Some(uuid.to_owned());
        self
    }
}

/// Build a [`DnaConfig`] with the id derived from the path.
#[must_use]
pub fn dna(file: &str) -> DnaConfig {
    DnaConfig { id: dna_path_to_id(file), file: file.to_owned(), uuid: None }
}

/// An agent identity inside the generated config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Conductor-local agent id.
    pub id: String,
    /// Display name; generated test agents encode conductor, instance,
    /// and scenario uuid.
    pub name: String,
    /// Keystore path, unused for test agents.
    pub keystore_file: String,
    /// Agent public address; the conductor rewrites it for test agents.
    pub public_address: String,
    /// Marks the agent as generated for tests.
    pub test_agent: bool,
}

/// A fully specified instance: an agent running a DNA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Conductor-local instance id.
    pub id: String,
    /// The agent running the instance.
    pub agent: AgentConfig,
    /// The DNA the instance runs.
    pub dna: DnaConfig,
}

/// A bridge from one instance to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Handle the caller uses to reach the callee.
    pub handle: String,
    /// Calling instance id.
    pub caller_id: String,
    /// Callee instance id.
    pub callee_id: String,
}

/// Build a [`BridgeConfig`].
#[must_use]
pub fn bridge(handle: &str, caller_id: &str, callee_id: &str) -> BridgeConfig {
    BridgeConfig {
        handle: handle.to_owned(),
        caller_id: caller_id.to_owned(),
        callee_id: callee_id.to_owned(),
    }
}

/// DPKI bootstrap section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpkiConfig {
    /// Instance acting as the DPKI provider.
    pub instance_id: String,
    /// JSON-encoded init params handed to the provider.
    pub init_params: String,
}

/// Build a [`DpkiConfig`]; `init_params` is serialized to JSON.
#[must_use]
pub fn dpki(instance_id: &str, init_params: &serde_json::Value) -> DpkiConfig {
    DpkiConfig { instance_id: instance_id.to_owned(), init_params: init_params.to_string() }
}

/// Network transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    /// In-memory transport, single machine.
    Memory,
    /// WebSocket transport.
    Websocket,
    /// Legacy n3h networking process.
    N3h,
}

impl NetworkType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Websocket => "websocket",
            Self::N3h => "n3h",
        }
    }
}

/// Instance layout: sugared map or explicit list.
#[derive(Debug, Clone)]
pub enum Instances {
    /// Map from instance id to the DNA it runs; agents are generated.
    Sugared(BTreeMap<String, DnaConfig>),
    /// Explicit instances with their agents.
    Plain(Vec<InstanceConfig>),
}

/// Everything scenario code specifies about one conductor.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Instances this conductor runs.
    pub instances: Instances,
    /// Inter-instance bridges.
    pub bridges: Vec<BridgeConfig>,
    /// Optional DPKI provider.
    pub dpki: Option<DpkiConfig>,
    /// Network transport.
    pub network: NetworkType,
    /// Verbose conductor logging.
    pub verbose: bool,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            instances: Instances::Sugared(BTreeMap::new()),
            bridges: Vec::new(),
            dpki: None,
            network: NetworkType::Memory,
            verbose: false,
        }
    }
}

impl ConductorConfig {
    /// Sugared config: instance id to DNA, defaults everywhere else.
    #[must_use]
    pub fn sugared<I, S>(instances: I) -> Self
    where
        I: IntoIterator<Item = (S, DnaConfig)>,
        S: Into<String>,
    {
        Self {
            instances: Instances::Sugared(
                instances.into_iter().map(|(id, dna)| (id.into(), dna)).collect(),
            ),
            ..Self::default()
        }
    }
}

/// Derive a DNA id from its file path: the basename, with a trailing
/// `.dna.json` stripped. Other extensions are kept as-is.
#[must_use]
pub fn dna_path_to_id(path: &str) -> String {
    let base = path.rsplit('/').next().unwrap_or(path);
    base.strip_suffix(".dna.json").unwrap_or(base).to_owned()
}

/// Path of the generated config file inside `dir`.
#[must_use]
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE_NAME)
}

/// Computes the hash recorded for a DNA file.
pub type DnaHasher = Arc<dyn Fn(&Path) -> Result<String> + Send + Sync>;

/// SHA-256 of the file contents, hex encoded.
///
/// # Errors
///
/// Returns [`HarnessError::Io`] when the file cannot be read.
pub fn hash_dna_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

/// The default [`DnaHasher`], [`hash_dna_file`].
#[must_use]
pub fn default_dna_hasher() -> DnaHasher {
    Arc::new(hash_dna_file)
}

/// Expand sugared instances into explicit ones with generated test
/// agents. Agent names follow `{conductor}::{instance}::{uuid}`.
#[must_use]
pub fn desugar_instances(config: &ConductorConfig, args: &GenConfigArgs) -> Vec<InstanceConfig> {
    match &config.instances {
        Instances::Plain(instances) => instances.clone(),
        Instances::Sugared(map) => map
            .iter()
            .map(|(id, dna)| InstanceConfig {
                id: id.clone(),
                agent: AgentConfig {
                    id: id.clone(),
                    name: format!("{}::{}::{}", args.conductor_name, id, args.uuid),
                    keystore_file: "[UNUSED]".into(),
                    public_address: "[SHOULD BE REWRITTEN]".into(),
                    test_agent: true,
                },
                dna: dna.clone(),
            })
            .collect(),
    }
}

// ── Rendered document ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct GeneratedConfig {
    agents: Vec<GeneratedAgent>,
    dnas: Vec<GeneratedDna>,
    instances: Vec<GeneratedInstance>,
    interfaces: Vec<GeneratedInterface>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bridges: Vec<GeneratedBridge>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dpki: Option<GeneratedDpki>,
    signals: GeneratedSignals,
    network: GeneratedNetwork,
    logger: GeneratedLogger,
}

#[derive(Serialize)]
struct GeneratedAgent {
    id: String,
    name: String,
    keystore_file: String,
    public_address: String,
    test_agent: bool,
}

#[derive(Serialize)]
struct GeneratedDna {
    id: String,
    file: String,
    hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    uuid: Option<String>,
}

#[derive(Serialize)]
struct GeneratedInstance {
    id: String,
    agent: String,
    dna: String,
    storage: GeneratedStorage,
}

#[derive(Serialize)]
struct GeneratedStorage {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
struct GeneratedInterface {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    admin: Option<bool>,
    driver: GeneratedDriver,
    instances: Vec<InstanceRef>,
}

#[derive(Serialize)]
struct GeneratedDriver {
    #[serde(rename = "type")]
    kind: String,
    port: u16,
}

#[derive(Serialize)]
struct InstanceRef {
    id: String,
}

#[derive(Serialize)]
struct GeneratedBridge {
    handle: String,
    caller_id: String,
    callee_id: String,
}

#[derive(Serialize)]
struct GeneratedDpki {
    instance_id: String,
    init_params: String,
}

#[derive(Serialize)]
struct GeneratedSignals {
    trace: bool,
    consistency: bool,
}

#[derive(Serialize)]
struct GeneratedNetwork {
    #[serde(rename = "type")]
    kind: String,
    transport_configs: Vec<GeneratedTransport>,
}

#[derive(Serialize)]
struct GeneratedTransport {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
struct GeneratedLogger {
    #[serde(rename = "type")]
    kind: String,
    state_dump: bool,
    rules: GeneratedLoggerRules,
}

#[derive(Serialize)]
struct GeneratedLoggerRules {
    rules: Vec<GeneratedLoggerRule>,
}

#[derive(Serialize)]
struct GeneratedLoggerRule {
    exclude: bool,
    pattern: String,
}

// ── Generation ────────────────────────────────────────────────────────────────

/// Render the complete conductor TOML document.
///
/// The document is built as a `toml::Value` tree before rendering, so
/// the output re-parses and re-renders byte-identically.
///
/// # Errors
///
/// Returns [`HarnessError::Config`] for invalid definitions or rendering
/// failures, plus whatever the DNA hasher reports.
pub fn gen_config(
    config: &ConductorConfig,
    args: &GenConfigArgs,
    hasher: &DnaHasher,
) -> Result<String> {
    let instances = desugar_instances(config, args);
    validate(&instances, &config.bridges)?;

    let mut agents: Vec<GeneratedAgent> = Vec::new();
    for instance in &instances {
        if agents.iter().all(|agent| agent.id != instance.agent.id) {
            agents.push(GeneratedAgent {
                id: instance.agent.id.clone(),
                name: instance.agent.name.clone(),
                keystore_file: instance.agent.keystore_file.clone(),
                public_address: instance.agent.public_address.clone(),
                test_agent: instance.agent.test_agent,
            });
        }
    }

    let mut dnas: Vec<GeneratedDna> = Vec::new();
    for instance in &instances {
        if dnas.iter().all(|dna| dna.id != instance.dna.id) {
            dnas.push(GeneratedDna {
                id: instance.dna.id.clone(),
                file: instance.dna.file.clone(),
                hash: hasher(Path::new(&instance.dna.file))?,
                uuid: instance.dna.uuid.clone(),
            });
        }
    }

    let generated = GeneratedConfig {
        agents,
        dnas,
        instances: instances
            .iter()
            .map(|instance| GeneratedInstance {
                id: instance.id.clone(),
                agent: instance.agent.id.clone(),
                dna: instance.dna.id.clone(),
                storage: GeneratedStorage { kind: "memory".into() },
            })
            .collect(),
        interfaces: vec![
            GeneratedInterface {
                id: "admin-interface".into(),
                admin: Some(true),
                driver: GeneratedDriver { kind: "websocket".into(), port: args.admin_port },
                instances: Vec::new(),
            },
            GeneratedInterface {
                id: "zome-interface".into(),
                admin: None,
                driver: GeneratedDriver { kind: "websocket".into(), port: args.zome_port },
                instances: instances
                    .iter()
                    .map(|instance| InstanceRef { id: instance.id.clone() })
                    .collect(),
            },
        ],
        bridges: config
            .bridges
            .iter()
            .map(|bridge| GeneratedBridge {
                handle: bridge.handle.clone(),
                caller_id: bridge.caller_id.clone(),
                callee_id: bridge.callee_id.clone(),
            })
            .collect(),
        dpki: config.dpki.as_ref().map(|dpki| GeneratedDpki {
            instance_id: dpki.instance_id.clone(),
            init_params: dpki.init_params.clone(),
        }),
        signals: GeneratedSignals { trace: config.verbose, consistency: true },
        network: GeneratedNetwork {
            kind: config.network.as_str().into(),
            transport_configs: vec![GeneratedTransport { kind: config.network.as_str().into() }],
        },
        logger: GeneratedLogger {
            kind: "debug".into(),
            state_dump: false,
            rules: GeneratedLoggerRules {
                rules: vec![GeneratedLoggerRule { exclude: !config.verbose, pattern: ".*".into() }],
            },
        },
    };

    let value = toml::Value::try_from(&generated)?;
    Ok(toml::to_string(&value)?)
}

/// Generate and write the config file for `args`, returning its path.
///
/// # Errors
///
/// Propagates generation failures; returns [`HarnessError::Io`] when the
/// file cannot be written.
pub fn write_config(
    config: &ConductorConfig,
    args: &GenConfigArgs,
    hasher: &DnaHasher,
) -> Result<PathBuf> {
    let rendered = gen_config(config, args, hasher)?;
    let path = config_path(&args.config_dir);
    fs::write(&path, rendered)?;
    Ok(path)
}

fn validate(instances: &[InstanceConfig], bridges: &[BridgeConfig]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for instance in instances {
        if instance.id.is_empty()
            || instance.agent.id.is_empty()
            || instance.dna.id.is_empty()
            || instance.dna.file.is_empty()
        {
            return Err(HarnessError::Config(format!(
                "invalid instance definition '{}': ids and dna file must be non-empty",
                instance.id
            )));
        }
        if !seen.insert(instance.id.as_str()) {
            return Err(HarnessError::Config(format!(
                "duplicate instance id '{}'",
                instance.id
            )));
        }
    }
    for bridge in bridges {
        if bridge.caller_id.is_empty() || bridge.callee_id.is_empty() {
            return Err(HarnessError::Config(format!(
                "invalid bridge '{}': caller and callee ids must be non-empty",
                bridge.handle
            )));
        }
    }
    Ok(())
}
