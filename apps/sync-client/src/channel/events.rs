//! Wire events exchanged over the event channel, and local lifecycle events.
//!
//! Every frame is JSON `{"t": <event name>, "d": <payload>}`. Event names are
//! closed enums, so the compiler checks the payload shape of each event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::message::{DeliveryState, MessageBody};
use crate::models::room::{Participant, PresenceState};

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Handshake metadata carried when the channel connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    pub token: String,
}

/// Frame type the client sends before any event.
pub const FRAME_IDENTIFY: &str = "identify";
/// Frame type the server answers a valid IDENTIFY with.
pub const FRAME_READY: &str = "ready";

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRoomPayload {
    pub room_id: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPayload {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub room_id: String,
    pub local_id: String,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessagePayload {
    pub room_id: String,
    /// Present only when the message originated from this client.
    #[serde(default)]
    pub local_id: Option<String>,
    pub server_id: String,
    pub sender_id: String,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPayload {
    pub room_id: String,
    pub user: Participant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterPayload {
    pub room_id: String,
    pub users: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub room_id: String,
    pub user_id: String,
    pub state: PresenceState,
}

/// Read/delivery receipt for a message already echoed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStatusPayload {
    pub room_id: String,
    pub server_id: String,
    pub state: DeliveryState,
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "d", rename_all = "snake_case")]
pub enum OutboundEvent {
    JoinRoom(JoinRoomPayload),
    LeaveRoom(RoomPayload),
    RequestRoster(RoomPayload),
    SendMessage(SendMessagePayload),
    StartTyping(TypingPayload),
    StopTyping(TypingPayload),
    PresenceUpdate(PresencePayload),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "join_room",
            Self::LeaveRoom(_) => "leave_room",
            Self::RequestRoster(_) => "request_roster",
            Self::SendMessage(_) => "send_message",
            Self::StartTyping(_) => "start_typing",
            Self::StopTyping(_) => "stop_typing",
            Self::PresenceUpdate(_) => "presence_update",
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "d", rename_all = "snake_case")]
pub enum InboundEvent {
    NewMessage(NewMessagePayload),
    UserJoined(MemberPayload),
    UserLeft(MemberPayload),
    RosterSnapshot(RosterPayload),
    StartTyping(TypingPayload),
    StopTyping(TypingPayload),
    PresenceUpdate(PresencePayload),
    MessageStatus(MessageStatusPayload),
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewMessage(_) => EventKind::NewMessage,
            Self::UserJoined(_) => EventKind::UserJoined,
            Self::UserLeft(_) => EventKind::UserLeft,
            Self::RosterSnapshot(_) => EventKind::RosterSnapshot,
            Self::StartTyping(_) => EventKind::StartTyping,
            Self::StopTyping(_) => EventKind::StopTyping,
            Self::PresenceUpdate(_) => EventKind::PresenceUpdate,
            Self::MessageStatus(_) => EventKind::MessageStatus,
        }
    }

    /// The room this event is scoped to.
    pub fn room_id(&self) -> &str {
        match self {
            Self::NewMessage(p) => &p.room_id,
            Self::UserJoined(p) | Self::UserLeft(p) => &p.room_id,
            Self::RosterSnapshot(p) => &p.room_id,
            Self::StartTyping(p) | Self::StopTyping(p) => &p.room_id,
            Self::PresenceUpdate(p) => &p.room_id,
            Self::MessageStatus(p) => &p.room_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Local lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Explicit,
    /// The link dropped without being asked to.
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    Error { message: String },
    /// Terminal: the reconnect budget is exhausted and retrying stopped.
    MaxReconnectReached { attempts: u32 },
}

/// Everything a channel handler can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Lifecycle(LifecycleEvent),
    Inbound(InboundEvent),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Lifecycle(LifecycleEvent::Connected) => EventKind::Connected,
            Self::Lifecycle(LifecycleEvent::Disconnected { .. }) => EventKind::Disconnected,
            Self::Lifecycle(LifecycleEvent::Error { .. }) => EventKind::Error,
            Self::Lifecycle(LifecycleEvent::MaxReconnectReached { .. }) => {
                EventKind::MaxReconnectReached
            }
            Self::Inbound(event) => event.kind(),
        }
    }
}

/// Key under which handlers are registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Error,
    MaxReconnectReached,
    NewMessage,
    UserJoined,
    UserLeft,
    RosterSnapshot,
    StartTyping,
    StopTyping,
    PresenceUpdate,
    MessageStatus,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::MaxReconnectReached => "max_reconnect_reached",
            Self::NewMessage => "new_message",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::RosterSnapshot => "roster_snapshot",
            Self::StartTyping => "start_typing",
            Self::StopTyping => "stop_typing",
            Self::PresenceUpdate => "presence_update",
            Self::MessageStatus => "message_status",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_frame_shape() {
        let event = OutboundEvent::LeaveRoom(RoomPayload {
            room_id: "room_a".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({"t": "leave_room", "d": {"room_id": "room_a"}}));
        assert_eq!(json["t"], event.name());
    }

    #[test]
    fn inbound_new_message_without_local_id() {
        let raw = serde_json::json!({
            "t": "new_message",
            "d": {
                "room_id": "room_a",
                "server_id": "srv_1",
                "sender_id": "usr_peer",
                "body": {"kind": "text", "content": "hola"},
                "timestamp": "2026-01-01T00:00:00Z"
            }
        });
        let event: InboundEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.kind(), EventKind::NewMessage);
        assert_eq!(event.room_id(), "room_a");
        match event {
            InboundEvent::NewMessage(p) => assert!(p.local_id.is_none()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_name_is_rejected() {
        let raw = serde_json::json!({"t": "self_destruct", "d": {}});
        assert!(serde_json::from_value::<InboundEvent>(raw).is_err());
    }

    #[test]
    fn lifecycle_kinds() {
        let event = ChannelEvent::Lifecycle(LifecycleEvent::MaxReconnectReached { attempts: 5 });
        assert_eq!(event.kind(), EventKind::MaxReconnectReached);
        assert_eq!(event.kind().as_str(), "max_reconnect_reached");
    }
}
