//! Frame codec for conductor channels.
//!
//! Frames are JSON text. A request carries `id`, `method`, and `params`;
//! the matching response echoes the `id` with either `result` or
//! `error`; an out-of-band event carries a `method` with no id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{HarnessError, Result};

/// Outbound request frame.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    /// Correlation id echoed by the matching response.
    pub id: u64,
    /// Namespaced method, e.g. `admin/dna/list` or `call`.
    pub method: &'a str,
    /// Method parameters.
    pub params: &'a Value,
}

/// Out-of-band event frame.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event kind, e.g. `signal`.
    pub method: String,
    /// Event payload.
    pub params: Value,
}

/// A classified inbound frame.
#[derive(Debug)]
pub enum Inbound {
    /// Response to a previously sent request.
    Response {
        /// Correlation id of the originating request.
        id: u64,
        /// Result payload, or the raw error payload.
        outcome: std::result::Result<Value, Value>,
    },
    /// Out-of-band event.
    Event(Event),
}

#[derive(Deserialize)]
struct RawFrame {
    id: Option<u64>,
    method: Option<String>,
    result: Option<Value>,
    error: Option<Value>,
    params: Option<Value>,
}

/// Render one request frame as JSON text.
///
/// # Errors
///
/// Returns [`HarnessError::Decode`] when the params cannot be serialized.
pub fn encode_request(id: u64, method: &str, params: &Value) -> Result<String> {
    Ok(serde_json::to_string(&Request { id, method, params })?)
}

/// Classify one inbound JSON text frame.
///
/// # Errors
///
/// Returns [`HarnessError::Decode`] for frames that are not valid JSON
/// or that fit neither the response nor the event shape.
pub fn decode_frame(text: &str) -> Result<Inbound> {
    let raw: RawFrame = serde_json::from_str(text)
        .map_err(|err| HarnessError::Decode(format!("malformed frame: {err}")))?;
    match (raw.id, raw.method) {
        (Some(id), _) => {
            let outcome = match raw.error {
                Some(error) => Err(error),
                None => Ok(raw.result.unwrap_or(Value::Null)),
            };
            Ok(Inbound::Response { id, outcome })
        }
        (None, Some(method)) => Ok(Inbound::Event(Event {
            method,
            params: raw.params.unwrap_or(Value::Null),
        })),
        (None, None) => Err(HarnessError::Decode(
            "frame carries neither a correlation id nor a method".into(),
        )),
    }
}
