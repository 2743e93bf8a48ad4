/// Shared types for the chat layer
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix marking a locally generated, not yet durable message id
pub const PROVISIONAL_PREFIX: &str = "tmp-";

/// Message identifier: durable (assigned by the gateway) or provisional (`tmp-…`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh provisional id for an optimistic entry
    pub fn provisional() -> Self {
        Self(format!("{}{}", PROVISIONAL_PREFIX, Uuid::new_v4()))
    }

    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Role {
    #[default]
    #[serde(rename = "usuario")]
    Customer,
    #[serde(rename = "asesor")]
    Advisor,
}

/// Denormalised display info for one side of a message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
}

impl Participant {
    /// Best human-readable label
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Local delivery state of a message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    /// Durable, confirmed by the gateway
    #[default]
    Confirmed,
    /// Optimistic entry, send in flight
    Pending,
    /// Optimistic entry whose durable send failed
    Failed { reason: String },
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub body: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<Participant>,
    #[serde(default)]
    pub delivery: DeliveryState,
}

impl Message {
    /// Optimistic entry shown before the gateway confirms the send
    pub fn provisional(body: impl Into<String>, sender: Participant, receiver_id: impl Into<String>) -> Self {
        Self {
            id: MessageId::provisional(),
            body: body.into(),
            sender_id: sender.id.clone(),
            receiver_id: receiver_id.into(),
            created_at: Utc::now(),
            sender: Some(sender),
            receiver: None,
            delivery: DeliveryState::Pending,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.id.is_provisional()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.delivery, DeliveryState::Failed { .. })
    }

    /// The other participant, seen from `me`
    pub fn peer_of(&self, me: &str) -> &str {
        if self.sender_id == me {
            &self.receiver_id
        } else {
            &self.sender_id
        }
    }

    /// Display info of the other participant, if the gateway joined it
    pub fn peer_info_of(&self, me: &str) -> Option<&Participant> {
        if self.sender_id == me {
            self.receiver.as_ref()
        } else {
            self.sender.as_ref()
        }
    }

    /// True when `me` sent or received the message
    pub fn involves(&self, me: &str) -> bool {
        self.sender_id == me || self.receiver_id == me
    }

    /// True when the message was exchanged between `me` and `peer`
    pub fn belongs_to(&self, me: &str, peer: &str) -> bool {
        (self.sender_id == me && self.receiver_id == peer)
            || (self.sender_id == peer && self.receiver_id == me)
    }
}

/// Ephemeral "peer is typing" fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
    pub peer_id: String,
    pub peer_display: String,
    /// Emission time, unix milliseconds
    pub emitted_at_ms: i64,
}

impl TypingEvent {
    pub fn now(peer_id: impl Into<String>, peer_display: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            peer_display: peer_display.into(),
            emitted_at_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Summary of one conversation thread (for the inbox list)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxEntry {
    /// The other party's user id
    pub peer_id: String,
    /// The other party's display info, when known
    pub peer: Option<Participant>,
    /// Most recent message exchanged with this peer
    pub last: Message,
}

/// Determinate result of a gateway-facing operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            message_id: None,
            error: None,
        }
    }

    pub fn ok_with_id(id: MessageId) -> Self {
        Self {
            success: true,
            message_id: Some(id),
            error: None,
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(msg.into()),
        }
    }

    /// Failure that still refers to a local entry (e.g. a failed optimistic send)
    pub fn failure_for(id: MessageId, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: Some(id),
            error: Some(msg.into()),
        }
    }
}

/// Real-time events for the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// The active conversation's message list changed
    ConversationChanged { peer_id: String },
    /// The active conversation was closed
    ConversationClosed,
    /// The global message list (and therefore the inbox) changed
    InboxChanged,
    /// The set of typing peers changed
    TypingChanged { typing: Vec<TypingEvent> },
    /// An optimistic send failed; the entry stays visible as failed
    MessageFailed { message_id: MessageId, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisional_ids_are_prefixed_and_unique() {
        let a = MessageId::provisional();
        let b = MessageId::provisional();
        assert!(a.is_provisional());
        assert!(a.as_str().starts_with("tmp-"));
        assert_ne!(a, b);
        assert!(!MessageId::new("42").is_provisional());
    }

    #[test]
    fn test_peer_of_and_belongs_to() {
        let me = Participant {
            id: "me".into(),
            ..Default::default()
        };
        let msg = Message::provisional("hi", me, "p1");
        assert_eq!(msg.peer_of("me"), "p1");
        assert_eq!(msg.peer_of("p1"), "me");
        assert!(msg.belongs_to("me", "p1"));
        assert!(msg.belongs_to("p1", "me"));
        assert!(!msg.belongs_to("me", "p2"));
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!(serde_json::to_string(&Role::Advisor).unwrap(), "\"asesor\"");
        let role: Role = serde_json::from_str("\"usuario\"").unwrap();
        assert_eq!(role, Role::Customer);
    }

    #[test]
    fn test_failed_outcome_serializes_error() {
        let v = serde_json::to_value(SendOutcome::failure("boom")).unwrap();
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "boom");
        assert!(v.get("message_id").is_none());
    }
}
