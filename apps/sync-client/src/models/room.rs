use serde::{Deserialize, Serialize};

/// A chat room a client can bind to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub display_name: String,
    pub language: String,
    #[serde(default)]
    pub is_private: bool,
}

impl Room {
    /// Metadata sent alongside `join_room`.
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "display_name": self.display_name,
            "language": self.language,
            "is_private": self.is_private,
        })
    }
}

/// Presence of a participant: "online", "away", "busy", or "offline".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    #[default]
    Online,
    Away,
    Busy,
    Offline,
}

/// A member of the current room as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub presence_state: PresenceState,
}
