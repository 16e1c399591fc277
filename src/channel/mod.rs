//! Duplex message channels into a conductor.
//!
//! A conductor exposes two WebSocket endpoints: a control interface for
//! administrative queries and an invocation interface for application
//! calls. Both speak the same frame protocol, so one client covers both.
//!
//! Submodules:
//! - `wire`: JSON text frame encoding and classification.
//! - `client`: [`ChannelClient`], one connection task owning the socket,
//!   the correlation map, and event fan-out.

pub mod client;
pub mod wire;

pub use client::{ChannelClient, DEFAULT_CLOSE_GRACE};
pub use wire::Event;
