#![forbid(unsafe_code)]

pub mod channel;
pub mod conductor;
pub mod config;
pub mod errors;
pub mod logging;
pub mod participant;
pub mod process;
pub mod scenario;
pub mod util;

pub use errors::{HarnessError, Result};
pub use scenario::Orchestrator;
