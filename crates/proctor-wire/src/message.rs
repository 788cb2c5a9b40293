use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::PairingToken;
use crate::status::EntityId;

/// Control messages understood by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Presents the role credential right after the socket opens.
    Verify {
        passcode: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pairing_token: Option<PairingToken>,
    },
    StatusRequest,
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    HeartbeatAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    StartMonitoring {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    /// Secondary device join state as reported by the signaling server.
    PhoneStatus { started: bool },
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Broadcast on the shared status endpoint; `status` is the raw code.
    EventStatus { event_id: EntityId, status: i64 },
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Verify { .. } => "verify",
            ControlMessage::StatusRequest => "status_request",
            ControlMessage::Heartbeat { .. } => "heartbeat",
            ControlMessage::HeartbeatAck { .. } => "heartbeat_ack",
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
            ControlMessage::StartMonitoring { .. } => "start_monitoring",
            ControlMessage::PhoneStatus { .. } => "phone_status",
            ControlMessage::Disconnect { .. } => "disconnect",
            ControlMessage::EventStatus { .. } => "event_status",
        }
    }
}

/// A typed frame whose shape is not one of the known control messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RawMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalMessage {
    Control(ControlMessage),
    Raw(RawMessage),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a json object")]
    NotAnObject,
    #[error("payload has no string `type` field")]
    MissingType,
}

impl SignalMessage {
    /// Parses one text frame. Non-JSON payloads and objects without a
    /// string `type` are rejected.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let object = value.as_object().ok_or(DecodeError::NotAnObject)?;
        match object.get("type") {
            Some(Value::String(_)) => {}
            _ => return Err(DecodeError::MissingType),
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &str {
        match self {
            SignalMessage::Control(control) => control.kind(),
            SignalMessage::Raw(raw) => &raw.kind,
        }
    }

    pub fn as_control(&self) -> Option<&ControlMessage> {
        match self {
            SignalMessage::Control(control) => Some(control),
            SignalMessage::Raw(_) => None,
        }
    }
}

impl From<ControlMessage> for SignalMessage {
    fn from(message: ControlMessage) -> Self {
        SignalMessage::Control(message)
    }
}

impl From<RawMessage> for SignalMessage {
    fn from(message: RawMessage) -> Self {
        SignalMessage::Raw(message)
    }
}
