//! Error taxonomy for the synchronization layer.

/// Errors surfaced by the channel, presence, delivery, watcher, and session
/// components.
///
/// Transient variants are retried internally (reconnect backoff, next poll
/// tick) and only reach callers once the retry policy gives up.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("connection error: {reason}")]
    Connection { reason: String },

    #[error("event channel is not connected")]
    NotConnected,

    #[error("delivery of {local_id} failed: {reason}")]
    DeliveryFailure { local_id: String, reason: String },

    #[error("status fetch for {operation_id} failed: {reason}")]
    PollFetch { operation_id: String, reason: String },

    #[error("session was invalidated by an account or network change")]
    SessionInvalidated,

    #[error("no room is currently joined")]
    NoActiveRoom,

    #[error("no wallet session is active")]
    NoSession,

    #[error("contract binding failed: {reason}")]
    Binding { reason: String },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl SyncError {
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    pub fn binding(reason: impl Into<String>) -> Self {
        Self::Binding {
            reason: reason.into(),
        }
    }

    pub fn poll_fetch(operation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PollFetch {
            operation_id: operation_id.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors that are retried rather than surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::NotConnected | Self::PollFetch { .. }
        )
    }
}

/// Error type returned by event handlers registered on the channel.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
