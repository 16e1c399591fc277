//! Error types shared across the harness.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared harness result type.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Harness error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum HarnessError {
    /// Conductor process could not be launched or its output read.
    Startup(String),
    /// Conductor process exited before emitting the readiness marker.
    ExitedEarly {
        /// Exit code reported by the OS, `None` when killed by a signal.
        code: Option<i32>,
    },
    /// Readiness marker did not appear on stdout within the deadline.
    ReadyTimeout {
        /// How long the harness waited before giving up.
        waited: Duration,
    },
    /// Channel endpoint unreachable, or the connection died mid-call.
    Connection(String),
    /// Zome call did not complete within the per-call timeout.
    CallTimeout {
        /// Instance the call was addressed to.
        instance_id: String,
        /// Zome the call was addressed to.
        zome: String,
        /// Function the call was addressed to.
        function: String,
        /// The configured timeout that elapsed.
        waited: Duration,
    },
    /// The remote endpoint answered with an error frame; payload preserved raw.
    Remote(serde_json::Value),
    /// Malformed frame or unexpected payload shape.
    Decode(String),
    /// Conductor metadata references an agent or DNA that does not exist.
    ReferentialIntegrity(String),
    /// Operation is invalid in the current lifecycle state.
    Guard(String),
    /// Conductor config validation or rendering failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// HTTP download failure.
    Download(String),
}

impl Display for HarnessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Startup(msg) => write!(f, "startup: {msg}"),
            Self::ExitedEarly { code: Some(code) } => {
                write!(f, "startup: conductor exited before readiness (exit code {code})")
            }
            Self::ExitedEarly { code: None } => {
                write!(f, "startup: conductor exited before readiness (killed by signal)")
            }
            Self::ReadyTimeout { waited } => {
                write!(f, "startup: readiness marker not seen within {}ms", waited.as_millis())
            }
            Self::Connection(msg) => write!(f, "connection: {msg}"),
            Self::CallTimeout { instance_id, zome, function, waited } => {
                write!(
                    f,
                    "zome call timed out after {}s: {instance_id}/{zome}/{function}",
                    waited.as_secs_f64()
                )
            }
            Self::Remote(payload) => write!(f, "remote error: {payload}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
            Self::ReferentialIntegrity(msg) => write!(f, "referential integrity: {msg}"),
            Self::Guard(msg) => write!(f, "guard: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Download(msg) => write!(f, "download: {msg}"),
        }
    }
}

impl std::error::Error for HarnessError {}

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for HarnessError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<toml::ser::Error> for HarnessError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(format!("failed to render config: {err}"))
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
