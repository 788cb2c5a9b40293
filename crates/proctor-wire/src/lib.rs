//! Wire shapes for the proctoring signaling channel.
//!
//! Every frame on the channel is a JSON object carrying a string `type`
//! field. Known control messages decode into [`ControlMessage`]; anything
//! else that still carries a `type` is preserved as a [`RawMessage`] so
//! that callers can route application-specific traffic without this crate
//! knowing about it.

mod message;
mod route;
mod status;

pub use message::{ControlMessage, DecodeError, RawMessage, SignalMessage};
pub use route::{EndpointPath, Role};
pub use status::{EntityId, EventStatus, StatusUpdate};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("{0} must not be empty")]
    EmptyIdentifier(&'static str),
    #[error("unknown event status code {0}")]
    UnknownStatusCode(i64),
}

/// Token minted by the primary device and embedded in the pairing link so
/// the secondary device can present it in its own `verify` message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairingToken(String);

impl PairingToken {
    pub fn mint() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn from_string(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wall-clock milliseconds since the unix epoch, as carried in heartbeat
/// and pong frames.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
