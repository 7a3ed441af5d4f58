//! Wire message types for the matching and signaling services
//!
//! All channel messages are JSON objects discriminated by an `event` field,
//! mapped here onto internally tagged enums.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::Role;

/// Messages pushed by the matching service over its WebSocket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum MatchingEvent {
    /// Two users were paired into a room
    Matched {
        room_code: String,
        #[serde(default)]
        initiator: bool,
    },

    /// Chat line relayed from the peer; `timestamp` is in seconds
    Chat {
        sender: String,
        message: String,
        timestamp: f64,
    },

    /// The peer left the room through the matching service
    PeerDisconnected {
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

/// Messages sent to the matching service over its WebSocket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum MatchingCommand {
    Chat { peer: String, message: String },
}

/// Body of `POST /registerForMatching`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
}

/// Response of `POST /registerForMatching`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Outcome of a registration, decoded from [`RegisterResponse::status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterStatus {
    Queued,
    /// The display name is already waiting in the queue
    Exists,
    Rejected(String),
}

impl From<&str> for RegisterStatus {
    fn from(status: &str) -> Self {
        match status {
            "queued" => RegisterStatus::Queued,
            "exists" => RegisterStatus::Exists,
            other => RegisterStatus::Rejected(other.to_string()),
        }
    }
}

/// One negotiation message (offer, answer or candidate) addressed to the peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalEnvelope {
    pub room_code: String,
    pub target: String,
    pub from: String,
    pub data: Value,
}

impl SignalEnvelope {
    /// Negotiation payload kind (`offer`, `answer`, `candidate`), if present
    pub fn kind(&self) -> Option<&str> {
        self.data.get("type").and_then(Value::as_str)
    }
}

/// Messages sent to the signaling service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SignalingCommand {
    /// Ask the service to verify our room membership
    Join {
        room_code: String,
        target: String,
        role: Role,
    },

    Signal(SignalEnvelope),
}

/// Messages pushed by the signaling service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SignalingEvent {
    /// Room membership confirmed; application traffic may flow
    Verified {
        #[serde(default)]
        room_code: Option<String>,
        #[serde(default)]
        role: Option<String>,
    },

    /// Negotiation payload relayed from the peer
    Signal {
        #[serde(default)]
        room_code: Option<String>,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        data: Value,
    },

    Error {
        #[serde(default)]
        message: Option<String>,
    },

    /// The peer's signaling connection dropped
    PeerDisconnected {
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(other)]
    Unknown,
}
