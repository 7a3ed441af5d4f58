//! Session data model: lifecycle state, room binding and chat log

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Separator the matching service uses to join both names into a room code
pub const ROOM_CODE_SEPARATOR: char = '_';

/// Negotiation role assigned by the matching service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates the first offer
    Initiator,
    /// Answers the initiator's offer
    Responder,
}

impl Role {
    /// Map the `initiator` flag of a `matched` event
    pub fn from_initiator_flag(initiator: bool) -> Self {
        if initiator {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    /// Lowercase name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall state of one client's match-to-call lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Registering,
    Queued,
    Searching,
    Matched,
    AcquiringMedia,
    JoiningSignaling,
    Negotiating,
    Connected,
    PeerDisconnected,
    RegisterFailed,
    MediaDenied,
    ChannelError(String),
    NegotiationError(String),
    MatchingDisconnected,
}

impl SessionState {
    /// True once a room binding drives the state, up to and including `Connected`
    pub fn in_call_setup(&self) -> bool {
        matches!(
            self,
            SessionState::Matched
                | SessionState::AcquiringMedia
                | SessionState::JoiningSignaling
                | SessionState::Negotiating
                | SessionState::Connected
        )
    }

    /// True while waiting in the matching queue
    pub fn is_waiting_for_match(&self) -> bool {
        matches!(
            self,
            SessionState::Registering | SessionState::Queued | SessionState::Searching
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Registering => f.write_str("registering"),
            SessionState::Queued => f.write_str("queued"),
            SessionState::Searching => f.write_str("searching"),
            SessionState::Matched => f.write_str("matched"),
            SessionState::AcquiringMedia => f.write_str("acquiring-media"),
            SessionState::JoiningSignaling => f.write_str("joining-signaling"),
            SessionState::Negotiating => f.write_str("negotiating"),
            SessionState::Connected => f.write_str("connected"),
            SessionState::PeerDisconnected => f.write_str("peer-disconnected"),
            SessionState::RegisterFailed => f.write_str("register-failed"),
            SessionState::MediaDenied => f.write_str("media-error"),
            SessionState::ChannelError(msg) => write!(f, "error: {}", msg),
            SessionState::NegotiationError(msg) => write!(f, "peer-error: {}", msg),
            SessionState::MatchingDisconnected => f.write_str("matching-service-disconnected"),
        }
    }
}

/// Pairing contract for one call, fixed at match time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomBinding {
    pub room_code: String,
    pub local_name: String,
    pub peer_name: String,
    pub role: Role,
}

impl RoomBinding {
    /// Build a binding from a `matched` event.
    ///
    /// The room code is both display names joined by `_`; the peer is whichever
    /// part is not ours. An unparseable code yields an empty peer name.
    pub fn from_match(room_code: &str, local_name: &str, initiator: bool) -> Self {
        let peer_name = room_code
            .split(ROOM_CODE_SEPARATOR)
            .find(|part| *part != local_name)
            .unwrap_or_default()
            .to_string();

        Self {
            room_code: room_code.to_string(),
            local_name: local_name.to_string(),
            peer_name,
            role: Role::from_initiator_flag(initiator),
        }
    }
}

/// One line of conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub sender: String,
    pub body: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub own: bool,
}

impl ChatMessage {
    /// A line we sent, stamped now
    pub fn own(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
            timestamp: now_millis(),
            own: true,
        }
    }

    /// A line received from the peer; the matching service stamps in seconds
    pub fn from_peer(sender: impl Into<String>, body: impl Into<String>, timestamp_secs: f64) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
            timestamp: (timestamp_secs * 1000.0).max(0.0) as u64,
            own: false,
        }
    }
}

/// Ordered, session-scoped chat history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    /// Append in arrival order
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Every line, oldest first
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Read-only projection of the session handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub status: String,
    pub display_name: Option<String>,
    pub registered: bool,
    pub matching_connected: bool,
    pub room_code: Option<String>,
    pub peer_name: Option<String>,
    pub role: Option<Role>,
    pub chat: Vec<ChatMessage>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            status: SessionState::Idle.to_string(),
            display_name: None,
            registered: false,
            matching_connected: false,
            room_code: None,
            peer_name: None,
            role: None,
            chat: Vec::new(),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_derives_peer_from_room_code() {
        let binding = RoomBinding::from_match("alice_bob", "alice", true);
        assert_eq!(binding.peer_name, "bob");
        assert_eq!(binding.role, Role::Initiator);

        let binding = RoomBinding::from_match("alice_bob", "bob", false);
        assert_eq!(binding.peer_name, "alice");
        assert_eq!(binding.role, Role::Responder);
    }

    #[test]
    fn binding_with_unexpected_code_has_empty_peer() {
        let binding = RoomBinding::from_match("alice", "alice", true);
        assert_eq!(binding.peer_name, "");
    }

    #[test]
    fn status_strings_match_ui_contract() {
        assert_eq!(SessionState::MediaDenied.to_string(), "media-error");
        assert_eq!(SessionState::PeerDisconnected.to_string(), "peer-disconnected");
        assert_eq!(
            SessionState::ChannelError("Invalid room or role".into()).to_string(),
            "error: Invalid room or role"
        );
        assert_eq!(
            SessionState::NegotiationError("ice failed".into()).to_string(),
            "peer-error: ice failed"
        );
        assert_eq!(
            SessionState::MatchingDisconnected.to_string(),
            "matching-service-disconnected"
        );
    }

    #[test]
    fn peer_chat_timestamp_is_converted_to_millis() {
        let msg = ChatMessage::from_peer("bob", "hi", 1_700_000_000.5);
        assert_eq!(msg.timestamp, 1_700_000_000_500);
        assert!(!msg.own);
    }

    #[test]
    fn chat_log_keeps_order_and_clears() {
        let mut log = ChatLog::default();
        log.push(ChatMessage::own("alice", "one"));
        log.push(ChatMessage::from_peer("bob", "two", 1.0));
        assert_eq!(
            log.messages().iter().map(|m| m.body.as_str()).collect::<Vec<_>>(),
            ["one", "two"]
        );
        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn setup_states_are_classified() {
        assert!(SessionState::Negotiating.in_call_setup());
        assert!(!SessionState::Queued.in_call_setup());
        assert!(SessionState::Searching.is_waiting_for_match());
    }
}
