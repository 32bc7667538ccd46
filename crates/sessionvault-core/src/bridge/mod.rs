//! Request/response channel between the UI process and the privileged
//! process that owns the session.
//!
//! Frames are newline-delimited JSON. Every request carries a correlation id
//! echoed by its response; session events are pushed unsolicited to
//! subscribed clients. Only redacted user views ever cross the bridge.

pub mod client;
pub mod protocol;
pub mod server;

use thiserror::Error;

pub use client::BridgeClient;
pub use protocol::{BridgeCall, BridgeMessage, BridgeRequest, BridgeResponse};
pub use server::BridgeServer;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("bridge I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge protocol error: {0}")]
    Protocol(String),

    #[error("bridge connection closed")]
    Closed,
}
