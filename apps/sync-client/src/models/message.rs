use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tandem_common::id::{prefix, PrefixedId};

/// Reference to an uploaded voice clip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceClip {
    pub url: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Voice,
}

/// Message content, tagged on the wire as `{"kind": .., "content": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    Voice(VoiceClip),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text(_) => MessageKind::Text,
            Self::Voice(_) => MessageKind::Voice,
        }
    }
}

/// Delivery progress of a message.
///
/// States only move forward in declaration order (`Sending` through `Read`).
/// `Failed` is absorbing and is only reachable from `Sending` or `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: DeliveryState) -> bool {
        match (self, next) {
            (Self::Failed, _) => false,
            (Self::Sending | Self::Sent, Self::Failed) => true,
            (_, Self::Failed) => false,
            (current, next) => next > current,
        }
    }

    /// Still waiting for the server to acknowledge the message.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Sending | Self::Sent)
    }
}

/// One entry of the local message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Client-generated correlation id; the reconciliation key.
    pub local_id: String,
    /// Assigned once the server echoes the message.
    pub server_id: Option<String>,
    pub room_id: String,
    pub sender_id: String,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

impl PrefixedId for Message {
    const PREFIX: &'static str = prefix::MSG;
}
