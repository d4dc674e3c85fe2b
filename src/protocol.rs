//! Wire format of the control channel.
//!
//! Inbound text frames carry a mandatory `type` discriminator; outbound
//! commands carry a `command` discriminator. Binary frames have no header
//! and are handled by the transport directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Message types the client knows how to interpret.
const KNOWN_TYPES: &[&str] = &[
    "status",
    "error",
    "audio_stream_end",
    "zapier_refreshed",
    "lifecycle",
];

/// Status text the agent sends once it can accept a spoken turn.
pub const AGENT_READY: &str = "Agent ready";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status { message: String },
    Error { message: String },
    AudioStreamEnd {},
    ZapierRefreshed { status: String },
    Lifecycle { event: String },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Status { .. } => "status",
            ServerMessage::Error { .. } => "error",
            ServerMessage::AudioStreamEnd {} => "audio_stream_end",
            ServerMessage::ZapierRefreshed { .. } => "zapier_refreshed",
            ServerMessage::Lifecycle { .. } => "lifecycle",
        }
    }
}

/// `zapier_refreshed.status` is `success` on success; the agent has used both
/// `failure` and `failed` for the opposite.
pub fn refresh_succeeded(status: &str) -> bool {
    status.eq_ignore_ascii_case("success")
}

/// Result of classifying one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ServerMessage),
    /// Well-formed JSON with a `type` the client does not handle
    Unknown(String),
}

/// Parse an inbound text frame.
///
/// Malformed JSON, a missing `type`, or a known type with a bad payload all
/// yield [`Error::Protocol`]; unknown types are not an error.
pub fn parse_server_message(text: &str) -> Result<Inbound> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::Protocol(format!("malformed message: {}", e)))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("message without type".to_string()))?
        .to_string();

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Ok(Inbound::Unknown(kind));
    }

    serde_json::from_value(value)
        .map(Inbound::Message)
        .map_err(|e| Error::Protocol(format!("invalid {} message: {}", kind, e)))
}

/// Commands sent to the agent as text frames.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    StopAgent,
    RefreshZapier,
}

impl ClientCommand {
    pub fn to_json(self) -> Result<String> {
        Ok(serde_json::to_string(&self)?)
    }
}
